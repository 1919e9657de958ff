//! Staff-side notification delivery.
//!
//! Three independent consumers drain the mailbox: a polling consumer, a
//! background worker and a push receiver. They share nothing but a
//! [`ClientContext`]; the mailbox's idempotent acknowledge is the only
//! synchronization point between them. A notification may therefore be
//! presented more than once; the presenter deduplicates by id on a
//! best-effort basis.

mod credentials;
mod poller;
mod presenter;
mod push;
mod worker;

pub use credentials::{Credential, CredentialStore};
pub use poller::{PollOutcome, PollingConsumer};
pub use presenter::{
    AlertSink, ConsoleSink, LogSink, NotificationPresenter, NotificationSink, Origin,
};
pub use push::{PushConsumer, push_router};
pub use worker::BackgroundWorker;

use crate::kv::KvError;
use crate::mailbox::Notification;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no API credentials available")]
    MissingCredential,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("mailbox unreachable: {0}")]
    Offline(String),

    #[error("mailbox rejected the API key")]
    Unauthorized,

    #[error("mailbox returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected mailbox response: {0}")]
    Decode(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),

    #[error(transparent)]
    Mailbox(#[from] KvError),
}

impl DeliveryError {
    /// Errors a consumer skips quietly and retries on its next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::Offline(_) | Self::Status { .. }
        )
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Offline(e.to_string())
        }
    }
}

/// Anything that can hand out pending notifications and take
/// acknowledgements for them.
#[async_trait]
pub trait MailboxSource: Send + Sync {
    async fn list_pending(&self, credential: &Credential)
    -> Result<Vec<Notification>, DeliveryError>;

    async fn acknowledge(
        &self,
        credential: &Credential,
        ids: &[String],
    ) -> Result<usize, DeliveryError>;
}

/// Talks to a remote ResDesk API with the credential's bearer key.
#[derive(Clone)]
pub struct HttpSource {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    #[serde(default)]
    notifications: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
struct MarkedResponse {
    #[serde(default)]
    marked: usize,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DeliveryError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DeliveryError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl MailboxSource for HttpSource {
    #[tracing::instrument(level = "debug", skip_all, fields(api_url = %credential.api_url))]
    async fn list_pending(
        &self,
        credential: &Credential,
    ) -> Result<Vec<Notification>, DeliveryError> {
        let response = self
            .http
            .get(credential.endpoint("/api/notifications/pending"))
            .bearer_auth(&credential.api_key)
            .send()
            .await?;
        let body: PendingResponse = Self::check(response).await?.json().await?;
        Ok(body.notifications)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(api_url = %credential.api_url, ids = ids.len()))]
    async fn acknowledge(
        &self,
        credential: &Credential,
        ids: &[String],
    ) -> Result<usize, DeliveryError> {
        let response = self
            .http
            .post(credential.endpoint("/api/notifications/mark-received"))
            .bearer_auth(&credential.api_key)
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await?;
        let body: MarkedResponse = Self::check(response).await?.json().await?;
        Ok(body.marked)
    }
}

/// Everything a consumer needs, passed explicitly.
#[derive(Clone)]
pub struct ClientContext {
    pub credentials: Arc<CredentialStore>,
    pub presenter: Arc<NotificationPresenter>,
    pub source: Arc<dyn MailboxSource>,
}

impl ClientContext {
    pub fn new(
        credentials: Arc<CredentialStore>,
        presenter: Arc<NotificationPresenter>,
        source: Arc<dyn MailboxSource>,
    ) -> Self {
        Self {
            credentials,
            presenter,
            source,
        }
    }
}

/// Result of one list/present/acknowledge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub listed: usize,
    pub presented: usize,
    pub acknowledged: usize,
}

/// Lists pending notifications, presents each and acknowledges every id
/// that was listed, including ones the presenter had already shown.
pub(crate) async fn drain_once(
    ctx: &ClientContext,
    credential: &Credential,
    origin: Origin,
) -> Result<CycleReport, DeliveryError> {
    let pending = ctx.source.list_pending(credential).await?;
    if pending.is_empty() {
        return Ok(CycleReport::default());
    }
    let mut report = CycleReport {
        listed: pending.len(),
        ..CycleReport::default()
    };
    let mut ids = Vec::with_capacity(pending.len());
    for notification in &pending {
        if ctx.presenter.present(notification, origin).await {
            report.presented += 1;
        }
        ids.push(notification.id.clone());
    }
    report.acknowledged = ctx.source.acknowledge(credential, &ids).await?;
    Ok(report)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::mailbox::{Mailbox, NewNotification, NotificationKind};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub seen: Mutex<Vec<(String, Origin)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn present(&self, notification: &Notification, origin: Origin) -> anyhow::Result<()> {
            self.seen
                .lock()
                .expect("seen")
                .push((notification.id.clone(), origin));
            Ok(())
        }
    }

    impl RecordingSink {
        pub fn ids(&self) -> Vec<String> {
            self.seen
                .lock()
                .expect("seen")
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    /// Reads the mailbox directly, skipping HTTP.
    pub struct InProcessSource {
        mailbox: Arc<Mailbox>,
    }

    impl InProcessSource {
        pub fn new(mailbox: Arc<Mailbox>) -> Self {
            Self { mailbox }
        }
    }

    #[async_trait]
    impl MailboxSource for InProcessSource {
        async fn list_pending(
            &self,
            _credential: &Credential,
        ) -> Result<Vec<Notification>, DeliveryError> {
            Ok(self.mailbox.list_pending().await?)
        }

        async fn acknowledge(
            &self,
            _credential: &Credential,
            ids: &[String],
        ) -> Result<usize, DeliveryError> {
            Ok(self.mailbox.acknowledge(ids).await)
        }
    }

    pub struct Fixture {
        pub mailbox: Arc<Mailbox>,
        pub sink: Arc<RecordingSink>,
        pub ctx: ClientContext,
    }

    pub async fn fixture(with_credential: bool) -> Fixture {
        let mailbox = Arc::new(Mailbox::new(Arc::new(MemoryKv::new())));
        let sink = Arc::new(RecordingSink::default());
        let presenter = Arc::new(NotificationPresenter::new(vec![
            sink.clone() as Arc<dyn NotificationSink>
        ]));
        let credentials = Arc::new(CredentialStore::in_memory());
        if with_credential {
            credentials
                .save(Credential::new("http://127.0.0.1:8080", "secret").expect("credential"))
                .await
                .expect("save");
        }
        let ctx = ClientContext::new(
            credentials,
            presenter,
            Arc::new(InProcessSource::new(mailbox.clone())),
        );
        Fixture { mailbox, sink, ctx }
    }

    pub async fn seed(mailbox: &Mailbox, title: &str) -> Notification {
        mailbox
            .create(NewNotification::new(NotificationKind::HelpNeeded, title, "body").for_user("u1"))
            .await
            .expect("create")
    }
}
