use super::{KvError, KvStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local store. Expired entries are evicted lazily on access.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let kv = MemoryKv::new();
        kv.put("chat_history:u1", json!([1, 2]), None)
            .await
            .expect("put");
        assert_eq!(
            kv.get("chat_history:u1").await.expect("get"),
            Some(json!([1, 2]))
        );
        kv.delete("chat_history:u1").await.expect("delete");
        kv.delete("chat_history:u1").await.expect("delete twice");
        assert_eq!(kv.get("chat_history:u1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let kv = MemoryKv::new();
        for key in ["b:2", "a:1", "b:1", "bb:0"] {
            kv.put(key, json!(key), None).await.expect("put");
        }
        assert_eq!(kv.list("b:").await.expect("list"), vec!["b:1", "b:2"]);
        assert_eq!(kv.list("").await.expect("list").len(), 4);
    }

    #[tokio::test]
    async fn expired_entries_disappear() {
        let kv = MemoryKv::new();
        kv.put("short", json!(1), Some(Duration::from_millis(10)))
            .await
            .expect("put");
        kv.put("long", json!(2), Some(Duration::from_secs(60)))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("short").await.expect("get"), None);
        assert_eq!(kv.list("").await.expect("list"), vec!["long"]);
        assert_eq!(kv.entries.len(), 1);
    }

    #[tokio::test]
    async fn put_refreshes_ttl() {
        let kv = MemoryKv::new();
        kv.put("k", json!(1), Some(Duration::from_millis(10)))
            .await
            .expect("put");
        kv.put("k", json!(2), None).await.expect("put again");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.expect("get"), Some(json!(2)));
    }
}
