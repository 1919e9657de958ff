//! Notification mailbox.
//!
//! A notification lives under `notification:undelivered:<id>` until some
//! consumer acknowledges it, at which point it is copied to
//! `notification:delivered:<id>` with `deliveredAt` stamped and the pending
//! entry is removed. Consumers race freely; `acknowledge` is idempotent per
//! id, so a notification may be shown more than once but is never lost.

use crate::conversation::now_millis;
use crate::kv::{KvError, KvStore};
use rd_channels::StaffAlert;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NOTIFICATION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const UNDELIVERED_PREFIX: &str = "notification:undelivered:";
const DELIVERED_PREFIX: &str = "notification:delivered:";

/// Notification type. The set is open: types this build does not know are
/// kept verbatim in `Other` so they survive storage and listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    HelpNeeded,
    OrderConfirmed,
    System,
    Test,
    NewMessage,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::HelpNeeded => "help_needed",
            Self::OrderConfirmed => "order_confirmed",
            Self::System => "system",
            Self::Test => "test",
            Self::NewMessage => "new_message",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "help_needed" => Self::HelpNeeded,
            "order_confirmed" => Self::OrderConfirmed,
            "system" => Self::System,
            "test" => Self::Test,
            "new_message" => Self::NewMessage,
            _ => Self::Other(raw),
        }
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl Notification {
    /// Staff-facing rendering; the receiving service owns final formatting.
    pub fn staff_alert(&self) -> StaffAlert {
        let who = self.user_id.as_deref().unwrap_or("inconnu");
        StaffAlert {
            subject: self.title.clone(),
            text: format!("{}\n\nClient : {who}\nType : {}", self.body, self.kind),
            urgent: self.urgent,
            payload: serde_json::to_value(self).unwrap_or_default(),
        }
    }
}

/// Everything the caller decides about a notification; the mailbox adds
/// the id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub user_id: Option<String>,
    pub urgent: bool,
    pub extra: serde_json::Value,
}

impl NewNotification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            user_id: None,
            urgent: false,
            extra: serde_json::Value::Null,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

pub struct Mailbox {
    kv: Arc<dyn KvStore>,
    ids: Mutex<ulid::Generator>,
}

impl Mailbox {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ids: Mutex::new(ulid::Generator::new()),
        }
    }

    /// ULIDs sort by creation time, so prefix listing is chronological.
    /// Uniqueness across processes is probabilistic (80 random bits).
    fn next_id(&self) -> String {
        let generated = self
            .ids
            .lock()
            .ok()
            .and_then(|mut generator| generator.generate().ok());
        generated.unwrap_or_else(ulid::Ulid::new).to_string()
    }

    #[tracing::instrument(level = "info", skip_all, fields(kind = %new.kind, urgent = new.urgent))]
    pub async fn create(&self, new: NewNotification) -> Result<Notification, KvError> {
        let notification = Notification {
            id: self.next_id(),
            kind: new.kind,
            title: new.title,
            body: new.body,
            user_id: new.user_id,
            timestamp: now_millis(),
            urgent: new.urgent,
            delivered_at: None,
            extra: new.extra,
        };
        let key = format!("{UNDELIVERED_PREFIX}{}", notification.id);
        let value = serde_json::to_value(&notification).map_err(|source| KvError::Codec {
            key: key.clone(),
            source,
        })?;
        self.kv.put(&key, value, Some(NOTIFICATION_TTL)).await?;
        tracing::info!(notification_id = %notification.id, "notification created");
        Ok(notification)
    }

    pub async fn list_pending(&self) -> Result<Vec<Notification>, KvError> {
        self.list_partition(UNDELIVERED_PREFIX).await
    }

    pub async fn list_delivered(&self) -> Result<Vec<Notification>, KvError> {
        self.list_partition(DELIVERED_PREFIX).await
    }

    /// Moves each still-pending id to the delivered partition and returns
    /// how many moved. Unknown or already-acknowledged ids are skipped; a
    /// failure on one id does not stop the rest.
    #[tracing::instrument(level = "info", skip_all, fields(requested = ids.len()))]
    pub async fn acknowledge<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        let mut marked = 0;
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() {
                continue;
            }
            match self.acknowledge_one(id).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(notification_id = id, error = %error, "acknowledge failed");
                }
            }
        }
        tracing::info!(marked, "notifications acknowledged");
        marked
    }

    async fn acknowledge_one(&self, id: &str) -> Result<bool, KvError> {
        let pending_key = format!("{UNDELIVERED_PREFIX}{id}");
        let Some(raw) = self.kv.get(&pending_key).await? else {
            return Ok(false);
        };
        let mut notification: Notification =
            serde_json::from_value(raw).map_err(|source| KvError::Codec {
                key: pending_key.clone(),
                source,
            })?;
        notification.delivered_at = Some(now_millis());

        let delivered_key = format!("{DELIVERED_PREFIX}{id}");
        let value = serde_json::to_value(&notification).map_err(|source| KvError::Codec {
            key: delivered_key.clone(),
            source,
        })?;
        self.kv
            .put(&delivered_key, value, Some(NOTIFICATION_TTL))
            .await?;
        self.kv.delete(&pending_key).await?;
        Ok(true)
    }

    async fn list_partition(&self, prefix: &str) -> Result<Vec<Notification>, KvError> {
        let keys = self.kv.list(prefix).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            // Entries can vanish between list and get when another consumer
            // acknowledges concurrently.
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_value::<Notification>(raw) {
                Ok(notification) => out.push(notification),
                Err(error) => tracing::warn!(key = %key, error = %error, "skipping malformed notification"),
            }
        }
        Ok(out)
    }
}
