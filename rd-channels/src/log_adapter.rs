use crate::traits::ChannelAdapter;
use crate::types::OutboundMessage;
use anyhow::{Result, anyhow};

/// Customer channel that only records outbound messages in the log.
/// Used when no messaging platform is configured (local runs, tests).
#[derive(Debug, Clone, Default)]
pub struct LogAdapter;

impl LogAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for LogAdapter {
    fn channel_id(&self) -> &str {
        "log"
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        if recipient_id.trim().is_empty() {
            return Err(anyhow!("recipient_id is required"));
        }
        let attachments: Vec<&str> = message.attachments.iter().map(|a| a.url.as_str()).collect();
        tracing::info!(
            recipient_id,
            content = %message.content,
            ?attachments,
            reply_to = ?message.reply_to_message_id,
            "outbound message (log channel)"
        );
        Ok(())
    }
}
