//! Periodic evaluation and cleanup loop
//!
//! Each tick takes a metrics snapshot, runs the anomaly rules over it,
//! emits whatever they produce, and then applies age-based retention to the
//! tracker and the alert history.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::alerts::{Alert, AlertSink};
use crate::anomaly::{AnomalyDetector, Thresholds};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::tracker::TransactionTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub operation_retention: Duration,
    pub alert_retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15_000),
            operation_retention: Duration::from_millis(86_400_000),
            alert_retention: Duration::from_millis(86_400_000),
        }
    }
}

/// Outcome of one monitoring tick
#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: MetricsSnapshot,
    pub alerts: Vec<Alert>,
    pub evicted_operations: usize,
    pub pruned_alerts: usize,
}

pub struct MonitoringService {
    tracker: Arc<TransactionTracker>,
    aggregator: MetricsAggregator,
    detector: Mutex<AnomalyDetector>,
    thresholds: Thresholds,
    alerts: Arc<AlertSink>,
    config: MonitorConfig,
}

impl MonitoringService {
    pub fn new(
        tracker: Arc<TransactionTracker>,
        alerts: Arc<AlertSink>,
        thresholds: Thresholds,
        cooldown: Duration,
        config: MonitorConfig,
    ) -> Self {
        Self {
            aggregator: MetricsAggregator::new(tracker.clone()),
            tracker,
            detector: Mutex::new(AnomalyDetector::new(cooldown)),
            thresholds,
            alerts,
            config,
        }
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Evaluate, alert and clean up once
    pub async fn tick(&self) -> TickReport {
        // Snapshot and rules see the same operation set
        let ops = self.tracker.all().await;
        let now = chrono::Utc::now();
        let snapshot = MetricsSnapshot::from_operations(&ops, now);

        let alerts = self
            .detector
            .lock()
            .await
            .evaluate_at(&snapshot, &ops, &self.thresholds, now);

        for alert in &alerts {
            self.alerts.emit(alert.clone());
        }

        let evicted_operations = self.tracker.evict(self.config.operation_retention).await;
        let pruned_alerts = self.alerts.prune(self.config.alert_retention);

        debug!(
            total = snapshot.total_ops,
            pending = snapshot.pending,
            failed = snapshot.failed,
            alerts = alerts.len(),
            evicted_operations,
            pruned_alerts,
            "Monitoring tick"
        );

        TickReport {
            snapshot,
            alerts,
            evicted_operations,
            pruned_alerts,
        }
    }

    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Monitoring service starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Monitoring service shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    self.tick().await;
                }
            }
        }
    }
}
