//! Per-user message history and hand-off metadata.
//!
//! History lives under `chat_history:<userId>` and metadata under
//! `chat_metadata:<userId>`, both expiring 24h after their last write.
//! Reads degrade to defaults when the store misbehaves; writes propagate.

use crate::kv::{KvError, KvStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const HISTORY_LIMIT: usize = 30;
pub const CONVERSATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const AI_AGENT: &str = "ai-agent";

const HISTORY_PREFIX: &str = "chat_history:";
const METADATA_PREFIX: &str = "chat_metadata:";

fn history_key(user_id: &str) -> String {
    format!("{HISTORY_PREFIX}{user_id}")
}

fn metadata_key(user_id: &str) -> String {
    format!("{METADATA_PREFIX}{user_id}")
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffStatus {
    #[serde(rename = "ai-handled")]
    AiHandled,
    #[serde(rename = "human-handled")]
    HumanHandled,
    #[serde(rename = "closed")]
    Closed,
}

impl HandoffStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiHandled => "ai-handled",
            Self::HumanHandled => "human-handled",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for HandoffStatus {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "ai-handled" => Ok(Self::AiHandled),
            "human-handled" => Ok(Self::HumanHandled),
            "closed" => Ok(Self::Closed),
            other => Err(StoreError::Validation(format!(
                "status must be one of ai-handled, human-handled, closed (got {other:?})"
            ))),
        }
    }
}

/// Who owns the conversation. A human hand-off always names its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    AiHandled,
    HumanHandled { agent_id: String },
    Closed { last_handler: String },
}

impl Handoff {
    pub fn status(&self) -> HandoffStatus {
        match self {
            Self::AiHandled => HandoffStatus::AiHandled,
            Self::HumanHandled { .. } => HandoffStatus::HumanHandled,
            Self::Closed { .. } => HandoffStatus::Closed,
        }
    }

    pub fn handled_by(&self) -> &str {
        match self {
            Self::AiHandled => AI_AGENT,
            Self::HumanHandled { agent_id } => agent_id,
            Self::Closed { last_handler } => last_handler,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawMetadata", into = "RawMetadata")]
pub struct Metadata {
    pub handoff: Handoff,
    pub created_at: i64,
    pub last_updated: i64,
}

impl Metadata {
    pub fn fresh(at: i64) -> Self {
        Self {
            handoff: Handoff::AiHandled,
            created_at: at,
            last_updated: at,
        }
    }

    pub fn status(&self) -> HandoffStatus {
        self.handoff.status()
    }

    pub fn handled_by(&self) -> &str {
        self.handoff.handled_by()
    }
}

/// Persisted layout: `{status, handledBy, createdAt, lastUpdated}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    status: HandoffStatus,
    #[serde(default)]
    handled_by: Option<String>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    last_updated: i64,
}

impl From<RawMetadata> for Metadata {
    fn from(raw: RawMetadata) -> Self {
        let handler = raw
            .handled_by
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let handoff = match (raw.status, handler) {
            (HandoffStatus::HumanHandled, Some(agent_id)) if agent_id != AI_AGENT => {
                Handoff::HumanHandled { agent_id }
            }
            // A human hand-off without a human is not a hand-off.
            (HandoffStatus::HumanHandled, _) | (HandoffStatus::AiHandled, _) => Handoff::AiHandled,
            (HandoffStatus::Closed, handler) => Handoff::Closed {
                last_handler: handler.unwrap_or_else(|| AI_AGENT.to_string()),
            },
        };
        Self {
            handoff,
            created_at: raw.created_at,
            last_updated: raw.last_updated,
        }
    }
}

impl From<Metadata> for RawMetadata {
    fn from(meta: Metadata) -> Self {
        Self {
            status: meta.handoff.status(),
            handled_by: Some(meta.handoff.handled_by().to_string()),
            created_at: meta.created_at,
            last_updated: meta.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub user_id: String,
    pub messages: Vec<Message>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub user_id: String,
    pub status: HandoffStatus,
    pub handled_by: String,
    pub created_at: i64,
    pub last_updated: i64,
    pub message_count: usize,
    pub last_message: Option<Message>,
    pub last_timestamp: Option<i64>,
}

#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KvStore>,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Appends a message, keeping only the most recent [`HISTORY_LIMIT`].
    /// The first message of a conversation initialises its metadata.
    #[tracing::instrument(level = "debug", skip(self, content))]
    pub async fn append_message(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        sent_by: Option<&str>,
    ) -> Result<Vec<Message>, StoreError> {
        let user_id = require_user_id(user_id)?;
        let existing = self.read_history(user_id).await?;
        let is_first = existing.is_none();
        let mut history = existing.unwrap_or_default();

        let message = Message {
            role,
            content: content.to_string(),
            timestamp: now_millis(),
            sent_by: sent_by.map(ToOwned::to_owned),
        };
        let at = message.timestamp;
        history.push(message);
        if history.len() > HISTORY_LIMIT {
            let overflow = history.len() - HISTORY_LIMIT;
            history.drain(..overflow);
        }
        self.kv
            .put(
                &history_key(user_id),
                encode(&history_key(user_id), &history)?,
                Some(CONVERSATION_TTL),
            )
            .await?;

        let metadata = if is_first {
            Metadata::fresh(at)
        } else {
            let mut metadata = self.get_metadata(user_id).await;
            metadata.last_updated = at;
            metadata
        };
        self.write_metadata(user_id, &metadata).await?;
        Ok(history)
    }

    /// Empty when the conversation is absent or the store cannot be read.
    pub async fn get_history(&self, user_id: &str) -> Vec<Message> {
        let user_id = user_id.trim();
        match self.read_history(user_id).await {
            Ok(history) => history.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(user_id, error = %error, "history read failed; using empty history");
                Vec::new()
            }
        }
    }

    /// Never fails: absent or unreadable metadata yields the AI-handled default.
    pub async fn get_metadata(&self, user_id: &str) -> Metadata {
        let user_id = user_id.trim();
        match self.read_metadata(user_id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => Metadata::fresh(now_millis()),
            Err(error) => {
                tracing::warn!(user_id, error = %error, "metadata read failed; using defaults");
                Metadata::fresh(now_millis())
            }
        }
    }

    /// `None` when no history exists for `user_id`.
    pub async fn get_conversation(&self, user_id: &str) -> Result<Option<Conversation>, StoreError> {
        let user_id = require_user_id(user_id)?;
        let Some(messages) = self.read_history(user_id).await? else {
            return Ok(None);
        };
        let metadata = self.get_metadata(user_id).await;
        Ok(Some(Conversation {
            user_id: user_id.to_string(),
            messages,
            metadata,
        }))
    }

    /// Changes who owns the conversation. Read-then-write: concurrent callers
    /// race and the last write wins.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn set_status(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        status: HandoffStatus,
    ) -> Result<Metadata, StoreError> {
        let user_id = require_user_id(user_id)?;
        let agent_id = agent_id.map(str::trim).filter(|a| !a.is_empty());
        if self.read_history(user_id).await?.is_none() {
            return Err(StoreError::NotFound(user_id.to_string()));
        }

        let mut metadata = self.get_metadata(user_id).await;
        metadata.handoff = match status {
            HandoffStatus::AiHandled => Handoff::AiHandled,
            HandoffStatus::HumanHandled => match agent_id {
                Some(agent_id) if agent_id != AI_AGENT => Handoff::HumanHandled {
                    agent_id: agent_id.to_string(),
                },
                _ => {
                    return Err(StoreError::Validation(
                        "agentId is required to hand a conversation to a human".to_string(),
                    ));
                }
            },
            HandoffStatus::Closed => Handoff::Closed {
                last_handler: agent_id
                    .unwrap_or_else(|| metadata.handled_by())
                    .to_string(),
            },
        };
        metadata.last_updated = now_millis();
        self.write_metadata(user_id, &metadata).await?;
        tracing::info!(user_id, handled_by = metadata.handled_by(), "hand-off updated");
        Ok(metadata)
    }

    /// Full prefix scan joined with metadata; newest activity first.
    pub async fn list_conversations(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let keys = self.kv.list(HISTORY_PREFIX).await?;
        let mut summaries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(user_id) = key.strip_prefix(HISTORY_PREFIX) else {
                continue;
            };
            let history = self.get_history(user_id).await;
            let metadata = self.get_metadata(user_id).await;
            let last_message = history.last().cloned();
            summaries.push(ConversationSummary {
                user_id: user_id.to_string(),
                status: metadata.status(),
                handled_by: metadata.handled_by().to_string(),
                created_at: metadata.created_at,
                last_updated: metadata.last_updated,
                message_count: history.len(),
                last_timestamp: last_message.as_ref().map(|m| m.timestamp),
                last_message,
            });
        }
        summaries.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| b.last_timestamp.cmp(&a.last_timestamp))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Drops the history and marks the conversation closed. Metadata is kept.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn clear_history(&self, user_id: &str) -> Result<Metadata, StoreError> {
        let user_id = require_user_id(user_id)?;
        self.kv.delete(&history_key(user_id)).await?;
        let mut metadata = self.get_metadata(user_id).await;
        metadata.handoff = Handoff::Closed {
            last_handler: metadata.handled_by().to_string(),
        };
        metadata.last_updated = now_millis();
        self.write_metadata(user_id, &metadata).await?;
        Ok(metadata)
    }

    async fn read_history(&self, user_id: &str) -> Result<Option<Vec<Message>>, StoreError> {
        let key = history_key(user_id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let history = serde_json::from_value(raw).map_err(|source| KvError::Codec { key, source })?;
        Ok(Some(history))
    }

    async fn read_metadata(&self, user_id: &str) -> Result<Option<Metadata>, StoreError> {
        let key = metadata_key(user_id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let metadata =
            serde_json::from_value(raw).map_err(|source| KvError::Codec { key, source })?;
        Ok(Some(metadata))
    }

    async fn write_metadata(&self, user_id: &str, metadata: &Metadata) -> Result<(), StoreError> {
        let key = metadata_key(user_id);
        let value = encode(&key, metadata)?;
        self.kv.put(&key, value, Some(CONVERSATION_TTL)).await?;
        Ok(())
    }
}

fn require_user_id(user_id: &str) -> Result<&str, StoreError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(StoreError::Validation("userId is required".to_string()));
    }
    Ok(user_id)
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<serde_json::Value, KvError> {
    serde_json::to_value(value).map_err(|source| KvError::Codec {
        key: key.to_string(),
        source,
    })
}
