use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Out-of-band alert for restaurant staff. The receiving service owns the
/// final formatting (email template, push presentation); `payload` carries
/// the raw notification so receivers can present it without another fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffAlert {
    pub subject: String,
    pub text: String,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait StaffAlerter: Send + Sync {
    async fn alert(&self, alert: &StaffAlert) -> Result<()>;
}

/// Posts alerts as JSON to an HTTP endpoint (mail relay, push gateway).
#[derive(Clone)]
pub struct WebhookAlerter {
    http: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl WebhookAlerter {
    pub fn new(url: &str) -> Result<Self> {
        let url = normalize_http_url(url, "alert webhook url")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl StaffAlerter for WebhookAlerter {
    #[tracing::instrument(level = "info", skip_all, fields(urgent = alert.urgent))]
    async fn alert(&self, alert: &StaffAlert) -> Result<()> {
        let response = self
            .authorized_request(self.http.post(&self.url))
            .json(alert)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "staff alert webhook failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

fn normalize_http_url(raw: &str, field: &str) -> Result<String> {
    let normalized = raw.trim().to_string();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(&normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_url_must_be_http() {
        assert!(WebhookAlerter::new("https://alerts.example.com/hook").is_ok());
        assert!(WebhookAlerter::new("ftp://alerts.example.com/hook").is_err());
        assert!(WebhookAlerter::new("   ").is_err());
    }

    #[test]
    fn blank_auth_token_is_dropped() {
        let alerter = WebhookAlerter::new("http://localhost:9000/push")
            .expect("alerter")
            .with_auth_token(Some("   ".to_string()));
        assert!(alerter.auth_token.is_none());
        let alerter = alerter.with_auth_token(Some(" secret ".to_string()));
        assert_eq!(alerter.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn alert_payload_defaults_when_fields_are_missing() {
        let alert: StaffAlert =
            serde_json::from_str(r#"{"subject":"s","text":"t"}"#).expect("parse");
        assert!(!alert.urgent);
        assert!(alert.payload.is_null());
    }
}
