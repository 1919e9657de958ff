//! Inbound customer queue: webhooks push parsed messages, one task drains
//! them through the responder and answers on the customer channel.

use crate::responder::{MenuDocument, Responder, TurnOutcome};
use anyhow::Result;
use rd_channels::{Attachment, ChannelAdapter, InboundMessage, OutboundMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const INBOUND_QUEUE_CAPACITY: usize = 256;

pub struct Gateway {
    responder: Arc<Responder>,
    channel: Arc<dyn ChannelAdapter>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl Gateway {
    pub fn new(
        responder: Arc<Responder>,
        channel: Arc<dyn ChannelAdapter>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            responder,
            channel,
            inbound_rx,
        }
    }

    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run_loop(shutdown))
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel = self.channel.channel_id()))]
    async fn run_loop(mut self, shutdown: CancellationToken) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.inbound_rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                break;
            };
            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
        tracing::info!("gateway loop exited");
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(user_id = %inbound.sender_id, message_id = %inbound.message_id)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let user_id = inbound.sender_id.as_str();
        let outcome = match self.responder.handle(user_id, &inbound.content).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The message could not be recorded; the customer still gets an answer.
                tracing::error!(%e, "responder failed before producing an outcome");
                TurnOutcome::Fallback {
                    text: self.responder.settings().fallback_text.clone(),
                    escalation: None,
                }
            }
        };

        let Some(outbound) = self.outbound_for(outcome) else {
            return Ok(());
        };
        self.channel
            .send(user_id, outbound.in_reply_to(inbound.message_id.clone()))
            .await
    }

    fn outbound_for(&self, outcome: TurnOutcome) -> Option<OutboundMessage> {
        match outcome {
            TurnOutcome::Reply { text, .. }
            | TurnOutcome::Goodbye { text }
            | TurnOutcome::Fallback { text, .. } => Some(OutboundMessage::text(text)),
            TurnOutcome::Menu { document } => Some(menu_message(&document, self.channel.as_ref())),
            TurnOutcome::NeedsHuman { .. } => None,
        }
    }
}

fn menu_message(document: &MenuDocument, channel: &dyn ChannelAdapter) -> OutboundMessage {
    if channel.supports_documents() {
        OutboundMessage::text(document.caption.as_str()).with_attachment(Attachment {
            name: document.filename.clone(),
            content_type: "application/pdf".to_string(),
            url: document.url.clone(),
        })
    } else {
        OutboundMessage::text(format!("{}\n{}", document.caption, document.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationStore, HandoffStatus, Role};
    use crate::kv::MemoryKv;
    use crate::mailbox::Mailbox;
    use crate::responder::ResponderSettings;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        documents: bool,
        sent: Mutex<Vec<(String, OutboundMessage)>>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn channel_id(&self) -> &str {
            "recording"
        }

        async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
            self.sent
                .lock()
                .expect("sent")
                .push((recipient_id.to_string(), message));
            Ok(())
        }

        fn supports_documents(&self) -> bool {
            self.documents
        }
    }

    fn inbound(from: &str, text: &str) -> InboundMessage {
        InboundMessage {
            message_id: "wamid.1".into(),
            channel_id: "whatsapp".into(),
            sender_id: from.into(),
            content: text.to_string(),
            sender_name: None,
            received_at: chrono::Utc::now(),
        }
    }

    fn build_gateway(
        channel: Arc<RecordingChannel>,
        settings: ResponderSettings,
    ) -> (Gateway, ConversationStore) {
        let kv = Arc::new(MemoryKv::new());
        let store = ConversationStore::new(kv.clone());
        let mailbox = Arc::new(Mailbox::new(kv));
        // No backend configured: free-form turns fall back immediately.
        let responder = Arc::new(Responder::new(store.clone(), mailbox, None, settings));
        let (_tx, rx) = mpsc::channel(1);
        (Gateway::new(responder, channel, rx), store)
    }

    #[tokio::test]
    async fn free_form_turn_without_backend_sends_fallback() {
        let channel = Arc::new(RecordingChannel::default());
        let (gateway, _) = build_gateway(channel.clone(), ResponderSettings::default());
        gateway
            .handle_inbound(inbound("33600000001", "Bonsoir"))
            .await
            .expect("handled");
        let sent = channel.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "33600000001");
        assert!(sent[0].1.content.starts_with("Désolé"));
        assert_eq!(
            sent[0].1.reply_to_message_id.as_ref().map(|m| m.as_str()),
            Some("wamid.1")
        );
    }

    #[tokio::test]
    async fn human_handled_conversation_sends_nothing() {
        let channel = Arc::new(RecordingChannel::default());
        let (gateway, store) = build_gateway(channel.clone(), ResponderSettings::default());
        store
            .append_message("u1", Role::User, "bonjour", None)
            .await
            .expect("seed");
        store
            .set_status("u1", Some("a1"), HandoffStatus::HumanHandled)
            .await
            .expect("take over");
        gateway
            .handle_inbound(inbound("u1", "toujours là ?"))
            .await
            .expect("handled");
        assert!(channel.sent.lock().expect("sent").is_empty());
    }

    #[tokio::test]
    async fn menu_goes_out_as_document_when_supported() {
        let settings = ResponderSettings {
            menu: Some(MenuDocument {
                url: "https://example.com/carte.pdf".to_string(),
                filename: "carte.pdf".to_string(),
                caption: "Notre carte".to_string(),
            }),
            ..ResponderSettings::default()
        };
        let channel = Arc::new(RecordingChannel {
            documents: true,
            ..RecordingChannel::default()
        });
        let (gateway, _) = build_gateway(channel.clone(), settings.clone());
        gateway
            .handle_inbound(inbound("u1", "la carte svp"))
            .await
            .expect("handled");
        {
            let sent = channel.sent.lock().expect("sent");
            assert_eq!(sent[0].1.attachments.len(), 1);
            assert_eq!(sent[0].1.content, "Notre carte");
        }

        let plain = Arc::new(RecordingChannel::default());
        let (gateway, _) = build_gateway(plain.clone(), settings);
        gateway
            .handle_inbound(inbound("u1", "menu"))
            .await
            .expect("handled");
        let sent = plain.sent.lock().expect("sent");
        assert!(sent[0].1.attachments.is_empty());
        assert!(sent[0].1.content.contains("https://example.com/carte.pdf"));
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancellation() {
        let channel = Arc::new(RecordingChannel::default());
        let kv = Arc::new(MemoryKv::new());
        let responder = Arc::new(Responder::new(
            ConversationStore::new(kv.clone()),
            Arc::new(Mailbox::new(kv)),
            None,
            ResponderSettings::default(),
        ));
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let handle = Gateway::new(responder, channel.clone(), rx).start(shutdown.clone());
        tx.send(inbound("u9", "bonjour")).await.expect("send");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.expect("join");
        assert_eq!(channel.sent.lock().expect("sent").len(), 1);
    }
}
