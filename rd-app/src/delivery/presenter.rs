use crate::mailbox::Notification;
use anyhow::Result;
use async_trait::async_trait;
use rd_channels::StaffAlerter;
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};

const DEFAULT_DEDUPE_CAPACITY: usize = 512;

/// Which consumer surfaced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Poll,
    Worker,
    Push,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Worker => "worker",
            Self::Push => "push",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn present(&self, notification: &Notification, origin: Origin) -> Result<()>;
}

/// Structured log line per notification.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn present(&self, notification: &Notification, origin: Origin) -> Result<()> {
        tracing::info!(
            notification_id = %notification.id,
            kind = %notification.kind,
            user_id = ?notification.user_id,
            urgent = notification.urgent,
            origin = %origin,
            title = %notification.title,
            "notification"
        );
        Ok(())
    }
}

/// Human-readable line on a terminal (stdout by default).
pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn present(&self, notification: &Notification, _origin: Origin) -> Result<()> {
        let marker = if notification.urgent { "!!" } else { "--" };
        let who = notification.user_id.as_deref().unwrap_or("-");
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("console sink mutex poisoned"))?;
        writeln!(
            out,
            "{marker} [{}] {} ({who})\n   {}",
            notification.kind, notification.title, notification.body
        )?;
        out.flush()?;
        Ok(())
    }
}

/// Forwards to the staff alert service (email relay, push gateway).
pub struct AlertSink {
    alerter: Arc<dyn StaffAlerter>,
}

impl AlertSink {
    pub fn new(alerter: Arc<dyn StaffAlerter>) -> Self {
        Self { alerter }
    }
}

#[async_trait]
impl NotificationSink for AlertSink {
    fn name(&self) -> &str {
        "alert"
    }

    async fn present(&self, notification: &Notification, _origin: Origin) -> Result<()> {
        self.alerter.alert(&notification.staff_alert()).await
    }
}

#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

/// Single dispatch path to every sink. Remembers recently presented ids so
/// the same notification arriving through several consumers is shown once
/// while it stays in the window.
pub struct NotificationPresenter {
    sinks: Vec<Arc<dyn NotificationSink>>,
    recent: Mutex<RecentIds>,
    capacity: usize,
}

impl NotificationPresenter {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_DEDUPE_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Arc<dyn NotificationSink>>, capacity: usize) -> Self {
        Self {
            sinks,
            recent: Mutex::new(RecentIds::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Returns `false` when the id was presented recently and nothing was
    /// dispatched. Sink failures are logged and do not stop other sinks.
    pub async fn present(&self, notification: &Notification, origin: Origin) -> bool {
        if !self.remember(&notification.id) {
            tracing::debug!(notification_id = %notification.id, origin = %origin, "duplicate notification suppressed");
            return false;
        }
        for sink in &self.sinks {
            if let Err(error) = sink.present(notification, origin).await {
                tracing::warn!(
                    sink = sink.name(),
                    notification_id = %notification.id,
                    error = %error,
                    "notification sink failed"
                );
            }
        }
        true
    }

    fn remember(&self, id: &str) -> bool {
        let Ok(mut recent) = self.recent.lock() else {
            return true;
        };
        if recent.seen.contains(id) {
            return false;
        }
        recent.seen.insert(id.to_string());
        recent.order.push_back(id.to_string());
        while recent.order.len() > self.capacity {
            if let Some(evicted) = recent.order.pop_front() {
                recent.seen.remove(&evicted);
            }
        }
        true
    }
}
