use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp", "log".
    fn channel_id(&self) -> &str;

    /// Send a message to a specific customer on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Whether document attachments are delivered as files rather than links.
    fn supports_documents(&self) -> bool {
        false
    }
}
