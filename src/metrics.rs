//! Aggregate metrics derived from tracker contents
//!
//! Nothing here keeps its own counters. Every snapshot is recomputed from the
//! tracker, so the numbers cannot drift from the operations they describe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::tracker::{TrackedOperation, TransactionTracker};
use crate::types::{millis_between, ChainId, OperationStatus};

/// Window used for the throughput figure
const THROUGHPUT_WINDOW_MS: u64 = 60_000;

/// Point-in-time view over all tracked operations
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_ops: u64,
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// `failed / (succeeded + failed)`, 0 when nothing has finished
    pub failure_rate: f64,
    /// Mean latency over Completed operations only
    pub average_latency_ms: f64,
    /// Operations finished during the last minute
    pub throughput_per_minute: u64,
    /// Operation count keyed by source chain
    pub per_chain_counts: BTreeMap<ChainId, u64>,
    pub taken_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn from_operations(ops: &[TrackedOperation], now: DateTime<Utc>) -> Self {
        let mut pending = 0u64;
        let mut succeeded = 0u64;
        let mut failed = 0u64;
        let mut latency_sum = 0u64;
        let mut throughput = 0u64;
        let mut per_chain_counts = BTreeMap::new();

        for op in ops {
            *per_chain_counts.entry(op.source_chain_id).or_insert(0) += 1;

            match op.status {
                OperationStatus::Pending => pending += 1,
                OperationStatus::Completed => {
                    succeeded += 1;
                    latency_sum += op.latency_ms().unwrap_or_default();
                }
                OperationStatus::Failed => failed += 1,
            }

            if let Some(end) = op.end_time {
                if end <= now && millis_between(end, now) <= THROUGHPUT_WINDOW_MS {
                    throughput += 1;
                }
            }
        }

        let finished = succeeded + failed;
        let failure_rate = if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        };
        let average_latency_ms = if succeeded == 0 {
            0.0
        } else {
            latency_sum as f64 / succeeded as f64
        };

        Self {
            total_ops: ops.len() as u64,
            pending,
            succeeded,
            failed,
            failure_rate,
            average_latency_ms,
            throughput_per_minute: throughput,
            per_chain_counts,
            taken_at: now,
        }
    }
}

/// Snapshot source bound to a tracker
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    tracker: Arc<TransactionTracker>,
}

impl MetricsAggregator {
    pub fn new(tracker: Arc<TransactionTracker>) -> Self {
        Self { tracker }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Utc::now()).await
    }

    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let ops = self.tracker.all().await;
        MetricsSnapshot::from_operations(&ops, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, OperationKind};
    use chrono::Duration;

    fn op(
        id: &str,
        source: ChainId,
        status: OperationStatus,
        start: DateTime<Utc>,
        latency_ms: i64,
    ) -> TrackedOperation {
        TrackedOperation {
            id: id.into(),
            kind: OperationKind::MirrorTransaction,
            source_chain_id: source,
            destination_chain_id: 99,
            start_time: start,
            end_time: status
                .is_terminal()
                .then(|| start + Duration::milliseconds(latency_ms)),
            status,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_empty_snapshot_has_zero_rate() {
        let snap = MetricsSnapshot::from_operations(&[], Utc::now());
        assert_eq!(snap.total_ops, 0);
        assert_eq!(snap.failure_rate, 0.0);
        assert_eq!(snap.average_latency_ms, 0.0);
    }

    #[test]
    fn test_latency_excludes_failed() {
        let now = Utc::now();
        let start = now - Duration::seconds(10);
        let ops = vec![
            op("a", 1, OperationStatus::Completed, start, 100),
            op("b", 1, OperationStatus::Completed, start, 300),
            op("c", 2, OperationStatus::Failed, start, 9_000),
            op("d", 2, OperationStatus::Pending, start, 0),
        ];
        let snap = MetricsSnapshot::from_operations(&ops, now);

        assert_eq!(snap.total_ops, 4);
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.average_latency_ms, 200.0);
        assert!((snap.failure_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.per_chain_counts[&1], 2);
        assert_eq!(snap.per_chain_counts[&2], 2);
        assert_eq!(snap.throughput_per_minute, 3);
    }

    #[test]
    fn test_throughput_window() {
        let now = Utc::now();
        let ops = vec![
            op("old", 1, OperationStatus::Completed, now - Duration::minutes(5), 10),
            op("new", 1, OperationStatus::Completed, now - Duration::seconds(5), 10),
        ];
        let snap = MetricsSnapshot::from_operations(&ops, now);
        assert_eq!(snap.throughput_per_minute, 1);
    }

    #[tokio::test]
    async fn test_aggregator_tracks_tracker() {
        let tracker = Arc::new(TransactionTracker::new());
        let aggregator = MetricsAggregator::new(tracker.clone());

        tracker
            .begin("op1", OperationKind::MirrorTransaction, 1, 2, Metadata::new())
            .await
            .unwrap();
        assert_eq!(aggregator.snapshot().await.pending, 1);

        tracker.complete("op1", true, Metadata::new()).await.unwrap();
        let snap = aggregator.snapshot().await;
        assert_eq!(snap.total_ops, 1);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.failure_rate, 0.0);
    }
}
