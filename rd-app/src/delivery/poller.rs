use super::{ClientContext, CycleReport, Origin, drain_once};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous poll was still running.
    Skipped,
    /// No credential or the mailbox was unreachable.
    Offline,
    Completed(CycleReport),
}

/// Client-driven consumer: a fixed timer plus explicit triggers. Overlapping
/// ticks are skipped, never queued.
pub struct PollingConsumer {
    ctx: ClientContext,
    interval: Duration,
    in_flight: AtomicBool,
    wake: Notify,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PollingConsumer {
    pub fn new(ctx: ClientContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            in_flight: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Requests an immediate poll, e.g. when the client becomes visible.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn poll_once(&self) -> PollOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("previous poll still running; skipping tick");
            return PollOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let credential = match self.ctx.credentials.load().await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                tracing::debug!("no credentials yet; skipping poll");
                return PollOutcome::Offline;
            }
            Err(error) => {
                tracing::debug!(%error, "credential store unavailable; skipping poll");
                return PollOutcome::Offline;
            }
        };

        match drain_once(&self.ctx, &credential, Origin::Poll).await {
            Ok(report) => {
                if report.listed > 0 {
                    tracing::info!(
                        listed = report.listed,
                        presented = report.presented,
                        acknowledged = report.acknowledged,
                        "poll delivered notifications"
                    );
                }
                PollOutcome::Completed(report)
            }
            Err(error) if error.is_transient() => {
                tracing::debug!(%error, "mailbox unavailable; skipping poll");
                PollOutcome::Offline
            }
            Err(error) => {
                tracing::warn!(%error, "poll failed");
                PollOutcome::Offline
            }
        }
    }

    /// Runs until `shutdown` fires. Each tick runs on its own task so a slow
    /// poll never delays the timer; the in-flight flag drops the overlap.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "polling consumer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.poll_once().await;
            });
        }
        tracing::info!("polling consumer stopped");
    }
}
