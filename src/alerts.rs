//! Alert history and subscriber fan-out
//!
//! [`AlertSink::emit`] appends the alert to the history and then queues it
//! for every subscriber. Each subscriber has its own queue and worker, so
//! emitting never waits on delivery. An error or panic in one subscriber is
//! logged and counted but never stops delivery to the others.

use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::types::{MetaValue, Metadata};

/// Hard cap on alerts kept in memory; age-based pruning normally removes
/// them well before this is reached
pub const DEFAULT_HISTORY_LIMIT: usize = 100_000;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub const ALL: [AlertLevel; 4] = [
        AlertLevel::Info,
        AlertLevel::Warning,
        AlertLevel::Error,
        AlertLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable operator notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self::at(level, message, Utc::now())
    }

    pub fn at(level: AlertLevel, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Consumer of emitted alerts
pub trait AlertSubscriber: Send + Sync {
    /// Name used in delivery logs
    fn name(&self) -> &str;

    fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Subscriber backed by a closure
pub struct FnSubscriber<F> {
    name: String,
    callback: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&Alert) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

impl<F> AlertSubscriber for FnSubscriber<F>
where
    F: Fn(&Alert) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, alert: &Alert) -> Result<()> {
        (self.callback)(alert)
    }
}

/// Writes alerts to the log at a matching level
#[derive(Debug, Default)]
pub struct ConsoleSubscriber;

impl AlertSubscriber for ConsoleSubscriber {
    fn name(&self) -> &str {
        "console"
    }

    fn notify(&self, alert: &Alert) -> Result<()> {
        let metadata = serde_json::to_string(&alert.metadata)?;
        match alert.level {
            AlertLevel::Info => info!(level = %alert.level, %metadata, "ALERT: {}", alert.message),
            AlertLevel::Warning => {
                warn!(level = %alert.level, %metadata, "ALERT: {}", alert.message)
            }
            AlertLevel::Error | AlertLevel::Critical => {
                error!(level = %alert.level, %metadata, "ALERT: {}", alert.message)
            }
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook
///
/// The request runs on a spawned task on the runtime the subscriber was
/// registered from; delivery failures are logged from that task.
pub struct WebhookSubscriber {
    url: String,
    client: reqwest::Client,
}

impl WebhookSubscriber {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl AlertSubscriber for WebhookSubscriber {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, alert: &Alert) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| eyre!("webhook delivery requires a tokio runtime"))?;

        let client = self.client.clone();
        let url = self.url.clone();
        let alert = alert.clone();
        handle.spawn(async move {
            match client.post(&url).json(&alert).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(status = %resp.status(), alert = %alert, "Webhook rejected alert")
                }
                Err(e) => warn!(error = %e, alert = %alert, "Webhook delivery failed"),
            }
        });
        Ok(())
    }
}

/// Delivery counters across every subscriber since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    /// Queued but not yet handed to the subscriber
    pub pending: u64,
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

/// A subscriber's queue; its worker exits once the sender is dropped
struct Subscription {
    name: String,
    queue: mpsc::UnboundedSender<Alert>,
}

/// Alert fan-out with bounded history
///
/// Each subscriber is drained by its own worker thread, so a slow or
/// hanging subscriber only delays its own queue.
pub struct AlertSink {
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<VecDeque<Alert>>,
    history_limit: usize,
    totals: [AtomicU64; 4],
    counters: Arc<DeliveryCounters>,
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl AlertSink {
    pub fn new(history_limit: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            totals: Default::default(),
            counters: Arc::new(DeliveryCounters::default()),
        }
    }

    /// Register a subscriber and start its delivery worker
    ///
    /// If called inside a tokio runtime, the worker enters that runtime
    /// around each delivery so subscribers may spawn tasks.
    pub fn subscribe(&self, subscriber: Arc<dyn AlertSubscriber>) -> Result<()> {
        let name = subscriber.name().to_string();
        let (queue, mut rx) = mpsc::unbounded_channel::<Alert>();
        let runtime = tokio::runtime::Handle::try_current().ok();
        let counters = self.counters.clone();

        std::thread::Builder::new()
            .name(format!("alert-{}", name))
            .spawn(move || {
                while let Some(alert) = rx.blocking_recv() {
                    let _guard = runtime.as_ref().map(|handle| handle.enter());
                    deliver(subscriber.as_ref(), &alert, &counters);
                    counters.pending.fetch_sub(1, Ordering::Relaxed);
                }
                debug!(subscriber = subscriber.name(), "Alert subscriber stopped");
            })
            .wrap_err_with(|| format!("Failed to start alert worker for {}", name))?;

        info!(subscriber = %name, "Alert subscriber registered");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { name, queue });
        Ok(())
    }

    /// Register a closure as a subscriber
    pub fn subscribe_fn<F>(&self, name: impl Into<String>, callback: F) -> Result<()>
    where
        F: Fn(&Alert) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber::new(name, callback)))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record the alert and queue it for every subscriber
    ///
    /// Never waits on a subscriber. Returns how many queues accepted it.
    pub fn emit(&self, alert: Alert) -> usize {
        self.totals[alert.level.index()].fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(alert.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut queued = 0;
        for subscription in subscriptions.iter() {
            self.counters.pending.fetch_add(1, Ordering::Relaxed);
            if subscription.queue.send(alert.clone()).is_ok() {
                queued += 1;
            } else {
                self.counters.pending.fetch_sub(1, Ordering::Relaxed);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(subscriber = %subscription.name, "Alert subscriber worker is gone");
            }
        }
        queued
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Alert history, newest first
    pub fn history(&self) -> Vec<Alert> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    /// Alerts at or above `level`, newest first
    pub fn history_at_least(&self, level: AlertLevel) -> Vec<Alert> {
        self.history()
            .into_iter()
            .filter(|a| a.level >= level)
            .collect()
    }

    /// Total alerts emitted at `level` since startup, including pruned ones
    pub fn total(&self, level: AlertLevel) -> u64 {
        self.totals[level.index()].load(Ordering::Relaxed)
    }

    /// Drop alerts older than `max_age`; returns how many were removed
    pub fn prune(&self, max_age: Duration) -> usize {
        self.prune_at(max_age, Utc::now())
    }

    pub fn prune_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let before = history.len();
        history.retain(|a| now - a.timestamp <= max_age);
        before - history.len()
    }
}

/// Hand one alert to one subscriber; errors and panics are logged and counted
fn deliver(subscriber: &dyn AlertSubscriber, alert: &Alert, counters: &DeliveryCounters) {
    match catch_unwind(AssertUnwindSafe(|| subscriber.notify(alert))) {
        Ok(Ok(())) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = subscriber.name(), error = %e, "Alert subscriber failed");
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(subscriber = subscriber.name(), "Alert subscriber panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_emit_records_history_newest_first() {
        let sink = AlertSink::default();
        sink.emit(Alert::new(AlertLevel::Info, "first"));
        sink.emit(Alert::new(AlertLevel::Error, "second"));

        let history = sink.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "second");
        assert_eq!(history[1].message, "first");
        assert_eq!(sink.total(AlertLevel::Error), 1);
        assert_eq!(sink.history_at_least(AlertLevel::Warning).len(), 1);
    }

    /// Block until every queued alert has been handed to its subscriber
    fn wait_for_delivery(sink: &AlertSink) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.delivery_stats().pending > 0 {
            assert!(Instant::now() < deadline, "alerts still queued");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let sink = AlertSink::default();
        let received = Arc::new(AtomicUsize::new(0));

        sink.subscribe_fn("broken", |_| Err(eyre!("endpoint down")))
            .unwrap();
        sink.subscribe_fn("panicky", |_| panic!("subscriber bug"))
            .unwrap();
        let counter = received.clone();
        sink.subscribe_fn("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert_eq!(sink.emit(Alert::new(AlertLevel::Warning, "high latency")), 3);
        wait_for_delivery(&sink);
        assert_eq!(
            sink.delivery_stats(),
            DeliveryStats {
                delivered: 1,
                failed: 2,
                pending: 0
            }
        );
        assert_eq!(received.load(Ordering::SeqCst), 1);

        // The panicking subscriber's worker survives for the next alert
        sink.emit(Alert::new(AlertLevel::Warning, "again"));
        wait_for_delivery(&sink);
        assert_eq!(sink.delivery_stats().failed, 4);
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocking_subscriber_does_not_delay_emit() {
        let sink = AlertSink::default();
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        sink.subscribe_fn("stuck", move |_| {
            let _ = gate
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(Duration::from_secs(10));
            Ok(())
        })
        .unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        sink.subscribe_fn("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        let started = Instant::now();
        for i in 0..3 {
            sink.emit(Alert::new(AlertLevel::Error, format!("chain {i} down")));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sink.history().len(), 3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while received.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "counter subscriber starved");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(sink.delivery_stats().pending > 0);

        for _ in 0..3 {
            release.send(()).unwrap();
        }
        wait_for_delivery(&sink);
        assert_eq!(sink.delivery_stats().delivered, 6);
    }

    #[test]
    fn test_subscriber_may_emit_without_deadlock() {
        let sink = Arc::new(AlertSink::default());
        let inner = sink.clone();
        sink.subscribe_fn("reentrant", move |alert| {
            if alert.level == AlertLevel::Critical {
                inner.emit(Alert::new(AlertLevel::Info, "escalated"));
            }
            Ok(())
        })
        .unwrap();

        sink.emit(Alert::new(AlertLevel::Critical, "failure burst"));
        wait_for_delivery(&sink);
        assert_eq!(sink.history().len(), 2);
        assert_eq!(sink.history()[0].message, "escalated");
    }

    #[test]
    fn test_history_is_bounded() {
        let sink = AlertSink::new(3);
        for i in 0..5 {
            sink.emit(Alert::new(AlertLevel::Info, format!("alert {i}")));
        }
        let history = sink.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "alert 4");
        assert_eq!(sink.total(AlertLevel::Info), 5);
    }

    #[test]
    fn test_prune_by_age() {
        let sink = AlertSink::default();
        let now = Utc::now();
        sink.emit(Alert::at(
            AlertLevel::Info,
            "old",
            now - chrono::Duration::hours(2),
        ));
        sink.emit(Alert::at(AlertLevel::Info, "fresh", now));

        let removed = sink.prune_at(Duration::from_secs(3600), now);
        assert_eq!(removed, 1);
        assert_eq!(sink.history()[0].message, "fresh");
    }

    #[test]
    fn test_alert_builder_metadata() {
        let alert = Alert::new(AlertLevel::Critical, "burst")
            .with("recentFailures", 3u64)
            .with("chainIds", "1");
        assert_eq!(alert.metadata["recentFailures"], MetaValue::Int(3));
        assert_eq!(alert.to_string(), "[critical] burst");
    }

    #[test]
    fn test_console_subscriber_accepts_all_levels() {
        let console = ConsoleSubscriber;
        for level in AlertLevel::ALL {
            assert!(console.notify(&Alert::new(level, "test")).is_ok());
        }
    }

    #[tokio::test]
    async fn test_subscriber_registered_in_runtime_can_spawn() {
        let sink = AlertSink::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sink.subscribe_fn("spawner", move |alert| {
            let tx = tx.clone();
            let message = alert.message.clone();
            tokio::spawn(async move {
                let _ = tx.send(message);
            });
            Ok(())
        })
        .unwrap();

        sink.emit(Alert::new(AlertLevel::Info, "spawned"));
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(message.as_deref(), Some("spawned"));
    }

    #[test]
    fn test_webhook_without_runtime_errors() {
        let webhook = WebhookSubscriber::new("http://localhost:1/alerts").unwrap();
        assert!(webhook
            .notify(&Alert::new(AlertLevel::Info, "no runtime"))
            .is_err());
    }
}
