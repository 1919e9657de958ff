use super::{KvError, KvStore};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Durable single-file store. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| KvError::Backend(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, KvError> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                r#"
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at);
"#,
            )?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, KvError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KvError::Backend("sqlite connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    r#"
SELECT value
  FROM kv
 WHERE key = ?1
   AND (expires_at IS NULL OR expires_at > ?2)
"#,
                    params![key, now_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| {
                serde_json::from_str(&raw).map_err(|source| KvError::Codec {
                    key: key.clone(),
                    source,
                })
            })
            .transpose()
        })
        .await
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value).map_err(|source| KvError::Codec {
            key: key.clone(),
            source,
        })?;
        let expires_at = ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis() as i64));
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO kv (key, value, expires_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE
SET value = excluded.value,
    expires_at = excluded.expires_at
"#,
                params![key, raw, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            let mut stmt = conn.prepare(
                r#"
SELECT key
  FROM kv
 WHERE substr(key, 1, length(?1)) = ?1
 ORDER BY key ASC
"#,
            )?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("resdesk.sqlite3");
        {
            let kv = SqliteKv::open(&path).await.expect("open");
            kv.put("chat_metadata:u1", json!({ "status": "ai-handled" }), None)
                .await
                .expect("put");
        }
        let kv = SqliteKv::open(&path).await.expect("reopen");
        assert_eq!(
            kv.get("chat_metadata:u1").await.expect("get"),
            Some(json!({ "status": "ai-handled" }))
        );
    }

    #[tokio::test]
    async fn prefix_listing_is_ordered_and_skips_expired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kv = SqliteKv::open(dir.path().join("kv.sqlite3"))
            .await
            .expect("open");
        kv.put("notification:undelivered:02", json!(2), None)
            .await
            .expect("put");
        kv.put("notification:undelivered:01", json!(1), None)
            .await
            .expect("put");
        kv.put("notification:delivered:00", json!(0), None)
            .await
            .expect("put");
        kv.put(
            "notification:undelivered:03",
            json!(3),
            Some(Duration::from_millis(5)),
        )
        .await
        .expect("put");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let keys = kv.list("notification:undelivered:").await.expect("list");
        assert_eq!(
            keys,
            vec!["notification:undelivered:01", "notification:undelivered:02"]
        );
        assert_eq!(
            kv.get("notification:undelivered:03").await.expect("get"),
            None
        );
    }

    #[tokio::test]
    async fn upsert_replaces_value_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kv = SqliteKv::open(dir.path().join("kv.sqlite3"))
            .await
            .expect("open");
        kv.put("k", json!("a"), None).await.expect("put");
        kv.put("k", json!("b"), None).await.expect("put");
        assert_eq!(kv.get("k").await.expect("get"), Some(json!("b")));
        kv.delete("k").await.expect("delete");
        kv.delete("k").await.expect("delete again");
        assert_eq!(kv.get("k").await.expect("get"), None);
    }
}
