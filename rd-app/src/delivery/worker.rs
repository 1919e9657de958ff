use super::{ClientContext, Credential, CycleReport, DeliveryError, Origin, drain_once};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Consumer that runs without any visible client. It keeps credentials only
/// for the duration of one cycle and re-derives them from the persistent
/// store on the next.
pub struct BackgroundWorker {
    ctx: ClientContext,
    interval: Duration,
    wake: Notify,
    held: Mutex<Option<Credential>>,
}

impl BackgroundWorker {
    pub fn new(ctx: ClientContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            wake: Notify::new(),
            held: Mutex::new(None),
        }
    }

    /// Asks for an immediate cycle. A credential passed here is used for
    /// that cycle only.
    pub async fn check_now(&self, credential: Option<Credential>) {
        if let Some(credential) = credential {
            *self.held.lock().await = Some(credential);
        }
        self.wake.notify_one();
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport, DeliveryError> {
        let held = self.held.lock().await.take();
        let credential = match held {
            Some(credential) => credential,
            None => self
                .ctx
                .credentials
                .load_persisted()
                .await?
                .ok_or(DeliveryError::MissingCredential)?,
        };
        drain_once(&self.ctx, &credential, Origin::Worker).await
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "background worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            match self.run_cycle().await {
                Ok(report) if report.listed > 0 => tracing::info!(
                    listed = report.listed,
                    presented = report.presented,
                    acknowledged = report.acknowledged,
                    "worker delivered notifications"
                ),
                Ok(_) => {}
                Err(error) if error.is_transient() => {
                    tracing::debug!(%error, "worker cycle skipped")
                }
                Err(error) => tracing::warn!(%error, "worker cycle failed"),
            }
        }
        tracing::info!("background worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::test_support::{InProcessSource, RecordingSink, fixture, seed};
    use crate::delivery::{CredentialStore, NotificationPresenter, NotificationSink};
    use crate::kv::MemoryKv;
    use crate::mailbox::Mailbox;

    #[tokio::test]
    async fn cycle_rederives_credentials_from_the_persistent_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let credentials = Arc::new(CredentialStore::with_file(dir.path().join("cred.json")));
        credentials
            .save(Credential::new("http://127.0.0.1:8080", "secret").expect("valid"))
            .await
            .expect("save");
        credentials.forget();

        let mailbox = Arc::new(Mailbox::new(Arc::new(MemoryKv::new())));
        let sink = Arc::new(RecordingSink::default());
        let ctx = ClientContext::new(
            credentials,
            Arc::new(NotificationPresenter::new(vec![
                sink.clone() as Arc<dyn NotificationSink>
            ])),
            Arc::new(InProcessSource::new(mailbox.clone())),
        );
        let n = seed(&mailbox, "Aide").await;

        let worker = BackgroundWorker::new(ctx, Duration::from_secs(60));
        let report = worker.run_cycle().await.expect("cycle");
        assert_eq!(report.acknowledged, 1);
        assert_eq!(sink.seen.lock().expect("seen")[0], (n.id, Origin::Worker));
    }

    #[tokio::test]
    async fn check_now_credential_lasts_one_cycle() {
        let f = fixture(false).await;
        seed(&f.mailbox, "Aide").await;
        let worker = BackgroundWorker::new(f.ctx.clone(), Duration::from_secs(60));

        worker
            .check_now(Some(
                Credential::new("http://127.0.0.1:8080", "secret").expect("valid"),
            ))
            .await;
        let report = worker.run_cycle().await.expect("cycle");
        assert_eq!(report.presented, 1);

        let err = worker.run_cycle().await.expect_err("no credential left");
        assert!(matches!(err, DeliveryError::MissingCredential));
    }

    #[tokio::test]
    async fn check_now_wakes_the_run_loop() {
        let f = fixture(true).await;
        let worker = Arc::new(BackgroundWorker::new(f.ctx.clone(), Duration::from_secs(3600)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let n = seed(&f.mailbox, "late").await;
        worker.check_now(None).await;
        for _ in 0..50 {
            if f.sink.ids().contains(&n.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.sink.ids().contains(&n.id));

        shutdown.cancel();
        handle.await.expect("join");
    }
}
