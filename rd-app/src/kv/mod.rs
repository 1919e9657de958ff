//! Key-value store adapter.
//!
//! The conversation store and the mailbox only ever talk to storage through
//! this narrow interface: single-key get/put/delete, prefix listing, and
//! per-entry expiry. No operation spans more than one key.

mod memory;
mod sqlite;

pub use memory::MemoryKv;
pub use sqlite::SqliteKv;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),

    #[error("kv value for {key} is not valid json: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<tokio::task::JoinError> for KvError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Backend(format!("blocking task failed: {e}"))
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns `None` for absent and expired keys alike.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError>;

    /// Writes `value`, replacing any previous entry and its expiry.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Live keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Cheap reachability probe used by the health route.
    async fn ping(&self) -> Result<(), KvError> {
        self.get("__ping__").await.map(|_| ())
    }
}
