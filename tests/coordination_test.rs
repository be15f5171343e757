//! End-to-end coordination tests against the in-memory chain client

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use bridge_coordinator::alerts::{AlertLevel, AlertSink};
use bridge_coordinator::anomaly::{AnomalyDetector, Thresholds};
use bridge_coordinator::coordinator::{BridgeCoordinator, CoordinatorConfig, DEFAULT_MIRROR_FEATURE};
use bridge_coordinator::error::{BridgeError, ChainError};
use bridge_coordinator::health::HealthMonitor;
use bridge_coordinator::metrics::MetricsAggregator;
use bridge_coordinator::registry::{ChainEntry, ChainRegistry};
use bridge_coordinator::retry::{RetryExecutor, RetryPolicy};
use bridge_coordinator::testing::MockChainClient;
use bridge_coordinator::tracker::{OperationFilter, TransactionTracker};
use bridge_coordinator::types::{Metadata, OperationKind, OperationStatus};

const SOURCE: u64 = 1;
const DESTINATION: u64 = 2;

struct Bridge {
    coordinator: BridgeCoordinator,
    registry: Arc<ChainRegistry>,
    tracker: Arc<TransactionTracker>,
    alerts: Arc<AlertSink>,
    source: Arc<MockChainClient>,
    destination: Arc<MockChainClient>,
}

async fn bridge() -> Bridge {
    let alerts = Arc::new(AlertSink::default());
    let registry = Arc::new(ChainRegistry::new(alerts.clone()));
    let tracker = Arc::new(TransactionTracker::new());

    let source = Arc::new(MockChainClient::new(SOURCE));
    let destination = Arc::new(MockChainClient::new(DESTINATION));
    destination.support_chain(SOURCE);
    destination.enable_feature(DEFAULT_MIRROR_FEATURE);

    registry
        .register(ChainEntry::new(SOURCE, "source", source.clone(), 1))
        .await;
    registry
        .register(ChainEntry::new(DESTINATION, "destination", destination.clone(), 1))
        .await;

    let executor = RetryExecutor::new(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(4),
        2.0,
    ));
    let coordinator = BridgeCoordinator::new(
        CoordinatorConfig::new(SOURCE, DESTINATION),
        registry.clone(),
        tracker.clone(),
        alerts.clone(),
        executor,
    );

    Bridge {
        coordinator,
        registry,
        tracker,
        alerts,
        source,
        destination,
    }
}

fn source_tx(n: u8) -> B256 {
    B256::with_last_byte(n)
}

#[tokio::test]
async fn test_begin_complete_counts_match_snapshot() {
    let tracker = Arc::new(TransactionTracker::new());
    let aggregator = MetricsAggregator::new(tracker.clone());

    for i in 0..7 {
        tracker
            .begin(
                format!("op{i}"),
                OperationKind::MirrorTransaction,
                1,
                2,
                Metadata::new(),
            )
            .await
            .unwrap();
    }
    for i in 0..5 {
        tracker
            .complete(&format!("op{i}"), i % 2 == 0, Metadata::new())
            .await
            .unwrap();
    }
    // Unknown ids never touch the metrics
    assert!(matches!(
        tracker.complete("missing", true, Metadata::new()).await,
        Err(BridgeError::UnknownOperation(_))
    ));

    let snap = aggregator.snapshot().await;
    assert_eq!(snap.total_ops, 7);
    assert_eq!(snap.succeeded + snap.failed, 5);
    assert_eq!(snap.succeeded, 3);
    assert_eq!(snap.pending, 2);
}

#[tokio::test]
async fn test_single_mirror_snapshot() {
    let tracker = Arc::new(TransactionTracker::new());
    let aggregator = MetricsAggregator::new(tracker.clone());

    tracker
        .begin("op1", OperationKind::MirrorTransaction, 1, 2, Metadata::new())
        .await
        .unwrap();
    tracker.complete("op1", true, Metadata::new()).await.unwrap();

    let snap = aggregator.snapshot().await;
    assert_eq!(snap.total_ops, 1);
    assert_eq!(snap.succeeded, 1);
    assert_eq!(snap.failed, 0);
    assert_eq!(snap.failure_rate, 0.0);
}

#[tokio::test]
async fn test_failure_burst_raises_one_critical_alert() {
    let tracker = Arc::new(TransactionTracker::new());
    let aggregator = MetricsAggregator::new(tracker.clone());

    for i in 0..5 {
        tracker
            .begin(
                format!("op{i}"),
                OperationKind::MirrorTransaction,
                1,
                2,
                Metadata::new(),
            )
            .await
            .unwrap();
    }
    for i in 0..3 {
        tracker
            .complete(&format!("op{i}"), false, Metadata::new())
            .await
            .unwrap();
    }

    let thresholds = Thresholds {
        failure_rate_threshold: 1.0,
        max_failures_per_minute: 3,
        ..Thresholds::default()
    };
    let mut detector = AnomalyDetector::new(Duration::from_secs(300));
    let snapshot = aggregator.snapshot().await;
    let alerts = detector.evaluate(&snapshot, &tracker.all().await, &thresholds);

    let critical: Vec<_> = alerts
        .iter()
        .filter(|a| a.level == AlertLevel::Critical)
        .collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].metadata["recentFailures"].as_i64(), Some(3));
    assert_eq!(critical[0].metadata["chainIds"].as_str(), Some("1"));
    assert_eq!(alerts.len(), 1);
}

#[tokio::test]
async fn test_mirror_confirms_and_records_latency() {
    let b = bridge().await;
    b.destination
        .set_confirmation_delay(Some(Duration::from_millis(20)));

    let submission = b
        .coordinator
        .mirror_transaction(
            SOURCE,
            Address::with_last_byte(9),
            source_tx(1),
            Bytes::from_static(b"mint"),
        )
        .await
        .unwrap();

    let pending = b.tracker.get(&submission.operation_id).await.unwrap();
    assert_eq!(pending.status, OperationStatus::Pending);

    let outcome = submission.confirmation.await.unwrap().unwrap();
    assert!(outcome.cross_chain_latency_ms >= 20);

    let op = b.tracker.get(&outcome.operation_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.source_chain_id, SOURCE);
    assert_eq!(op.destination_chain_id, DESTINATION);
    assert_eq!(
        op.metadata["crossChainLatencyMs"].as_i64(),
        Some(outcome.cross_chain_latency_ms as i64)
    );
    assert!(b.destination.is_mirrored(source_tx(1)));
}

#[tokio::test]
async fn test_mirror_preconditions_fail_before_tracking() {
    let b = bridge().await;

    let err = b
        .coordinator
        .mirror_transaction(77, Address::ZERO, source_tx(2), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedChain(77)));

    b.destination.disable_feature(DEFAULT_MIRROR_FEATURE);
    let err = b
        .coordinator
        .mirror_transaction(SOURCE, Address::ZERO, source_tx(2), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::FeatureDisabled(name) if name == DEFAULT_MIRROR_FEATURE));

    assert!(b.tracker.is_empty().await);
    assert_eq!(b.destination.sent_count("mirrorTransaction"), 0);
}

#[tokio::test]
async fn test_mirror_retries_transient_send_failures() {
    let b = bridge().await;
    b.destination
        .fail_next_send(ChainError::Transport("connection reset".into()));
    b.destination.fail_next_send(ChainError::Rpc {
        code: -32000,
        message: "header not found".into(),
    });

    let submission = b
        .coordinator
        .mirror_transaction(SOURCE, Address::ZERO, source_tx(3), Bytes::new())
        .await
        .unwrap();
    submission.confirmation.await.unwrap().unwrap();

    assert_eq!(b.destination.sent_count("mirrorTransaction"), 3);
}

#[tokio::test]
async fn test_failed_mirror_confirmation_is_recorded_with_alert() {
    let b = bridge().await;
    b.destination.revert_next_receipt();

    let submission = b
        .coordinator
        .mirror_transaction(SOURCE, Address::ZERO, source_tx(4), Bytes::new())
        .await
        .unwrap();
    let err = submission.confirmation.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::ContractRejection { .. }));

    let op = b.tracker.get(&submission.operation_id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.failure_reason().unwrap().contains("reverted"));

    let errors = b.alerts.history_at_least(AlertLevel::Error);
    assert_eq!(errors.len(), 1);
    let alert = &errors[0];
    assert_eq!(alert.metadata["operationId"].as_str(), Some(submission.operation_id.as_str()));
    assert_eq!(alert.metadata["sourceChainId"].as_i64(), Some(SOURCE as i64));
    assert_eq!(alert.metadata["destinationChainId"].as_i64(), Some(DESTINATION as i64));
}

#[tokio::test]
async fn test_mirroring_same_transaction_twice_while_pending() {
    let b = bridge().await;
    b.destination
        .set_confirmation_delay(Some(Duration::from_millis(100)));

    let first = b
        .coordinator
        .mirror_transaction(SOURCE, Address::ZERO, source_tx(5), Bytes::new())
        .await
        .unwrap();
    let err = b
        .coordinator
        .mirror_transaction(SOURCE, Address::ZERO, source_tx(5), Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateId(_)));

    first.confirmation.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_governance_quorum_and_execution() {
    let b = bridge().await;
    b.source.set_threshold(2);

    let id = b
        .coordinator
        .propose_governance_action(
            Address::with_last_byte(1),
            U256::from(0u8),
            Bytes::from_static(b"pause"),
        )
        .await
        .unwrap();

    let status = b.coordinator.sign_governance_action(id).await.unwrap();
    assert!(!status.executable);
    assert!(matches!(
        b.coordinator.execute_governance_action(id).await,
        Err(BridgeError::InsufficientSignatures { signatures: 1, threshold: 2, .. })
    ));

    // Second signer
    b.source.add_signature(id);
    let status = b.coordinator.governance_status(id).await.unwrap();
    assert!(status.executable);

    b.coordinator.execute_governance_action(id).await.unwrap();
    assert!(b.source.is_executed(id));

    let governance = b
        .tracker
        .query(&OperationFilter::default().with_kind_prefix("governance"))
        .await;
    assert_eq!(governance.len(), 3);
    assert!(governance.iter().all(|op| op.status == OperationStatus::Completed));
}

#[tokio::test]
async fn test_health_edge_triggered_through_monitor() {
    let b = bridge().await;
    let monitor = HealthMonitor::new(
        b.registry.clone(),
        Duration::from_secs(30),
        Duration::from_millis(100),
    );

    b.destination.set_offline(true);
    monitor.check_all().await;
    monitor.check_all().await;
    b.destination.set_offline(false);
    monitor.check_all().await;

    let history = b.alerts.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].level, AlertLevel::Error);
    assert_eq!(history[0].level, AlertLevel::Info);
    assert!(b.registry.get(DESTINATION).await.unwrap().healthy);
}
