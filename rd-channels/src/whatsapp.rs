use crate::traits::ChannelAdapter;
use crate::types::{Attachment, InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;

const WHATSAPP_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v20.0";

#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
        })
    }

    fn messages_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "{WHATSAPP_GRAPH_BASE_URL}/{}/messages",
            self.phone_number_id
        ))
        .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }

    async fn post_payload(&self, payload: serde_json::Value) -> Result<()> {
        let url = self.messages_url()?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp send failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    #[tracing::instrument(level = "info", skip_all, fields(recipient_id = %recipient_id))]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (E.164 phone number) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() && message.attachments.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        if message.attachments.is_empty() {
            return self.post_payload(text_payload(to, text)).await;
        }

        // The caption rides on the first document only.
        for (index, attachment) in message.attachments.iter().enumerate() {
            let caption = if index == 0 { text } else { "" };
            self.post_payload(document_payload(to, attachment, caption))
                .await?;
        }
        Ok(())
    }

    fn supports_documents(&self) -> bool {
        true
    }
}

fn text_payload(to: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": text,
        }
    })
}

fn document_payload(to: &str, attachment: &Attachment, caption: &str) -> serde_json::Value {
    let mut document = serde_json::json!({
        "link": attachment.url,
        "filename": attachment.name,
    });
    if !caption.is_empty() {
        document["caption"] = serde_json::Value::String(caption.to_string());
    }
    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "document",
        "document": document,
    })
}

/// Extracts customer text messages from a WhatsApp Cloud webhook body.
/// Status callbacks, reactions and media are ignored.
pub fn parse_webhook_payload(body: &serde_json::Value) -> Vec<InboundMessage> {
    let Ok(envelope) = serde_json::from_value::<WebhookEnvelope>(body.clone()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for change in envelope.entry.into_iter().flat_map(|e| e.changes) {
        let value = change.value;
        for msg in value.messages {
            if msg.kind != "text" {
                tracing::debug!(message_type = %msg.kind, "whatsapp webhook: skipping non-text message");
                continue;
            }
            let Some(text) = msg.text.map(|t| t.body) else {
                continue;
            };
            let content = text.trim();
            let from = msg.from.trim();
            if content.is_empty() || from.is_empty() {
                continue;
            }
            let sender_name = value
                .contacts
                .iter()
                .find(|c| c.wa_id == from)
                .and_then(|c| c.profile.as_ref())
                .map(|p| p.name.clone());
            let received_at = msg
                .timestamp
                .as_deref()
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .unwrap_or_else(Utc::now);
            out.push(InboundMessage {
                message_id: msg.id.into(),
                channel_id: "whatsapp".into(),
                sender_id: from.into(),
                content: content.to_string(),
                sender_name,
                received_at,
            });
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookEnvelope {
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookEntry {
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookChange {
    value: WebhookValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookValue {
    contacts: Vec<WebhookContact>,
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookContact {
    wa_id: String,
    profile: Option<WebhookProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookProfile {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookMessage {
    id: String,
    from: String,
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    text: Option<WebhookText>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebhookText {
    body: String,
}
