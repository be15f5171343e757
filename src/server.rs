//! HTTP server for health, status and metrics endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::registry::{ChainRegistry, ChainStatus};
use crate::tracker::{OperationFilter, TrackedOperation, TransactionTracker};
use crate::types::{ChainId, OperationStatus};

/// Default page size for list endpoints
const DEFAULT_LIMIT: usize = 100;

/// Prometheus metrics, refreshed from a fresh snapshot on every scrape
pub struct Metrics {
    pub operations_retained: IntGauge,
    pub operations_succeeded: IntGauge,
    pub operations_failed: IntGauge,
    pub operations_pending: IntGauge,
    pub failure_rate: Gauge,
    pub average_latency_ms: Gauge,
    pub alerts_total: IntGaugeVec,
    pub chain_healthy: IntGaugeVec,
    pub chain_block_number: IntGaugeVec,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let operations_retained = IntGauge::new(
            "bridge_operations_retained",
            "Tracked operations currently retained",
        )
        .expect("constant metric name is valid");

        let operations_succeeded = IntGauge::new(
            "bridge_operations_succeeded",
            "Retained operations that completed",
        )
        .expect("constant metric name is valid");

        let operations_failed = IntGauge::new(
            "bridge_operations_failed",
            "Retained operations that failed",
        )
        .expect("constant metric name is valid");

        let operations_pending = IntGauge::new(
            "bridge_operations_pending",
            "Operations still waiting for a result",
        )
        .expect("constant metric name is valid");

        let failure_rate = Gauge::new(
            "bridge_failure_rate",
            "Failed / finished operations",
        )
        .expect("constant metric name is valid");

        let average_latency_ms = Gauge::new(
            "bridge_average_latency_ms",
            "Mean latency of completed operations in milliseconds",
        )
        .expect("constant metric name is valid");

        let alerts_total = IntGaugeVec::new(
            Opts::new("bridge_alerts_total", "Alerts emitted since startup"),
            &["level"],
        )
        .expect("constant metric name is valid");

        let chain_healthy = IntGaugeVec::new(
            Opts::new("bridge_chain_healthy", "1 if the last liveness check succeeded"),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let chain_block_number = IntGaugeVec::new(
            Opts::new("bridge_chain_block_number", "Block height seen by the last check"),
            &["chain"],
        )
        .expect("constant metric name is valid");

        registry
            .register(Box::new(operations_retained.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(operations_succeeded.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(operations_failed.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(operations_pending.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(failure_rate.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(average_latency_ms.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(alerts_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(chain_healthy.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(chain_block_number.clone()))
            .expect("metric registration must not be called twice");

        Self {
            operations_retained,
            operations_succeeded,
            operations_failed,
            operations_pending,
            failure_rate,
            average_latency_ms,
            alerts_total,
            chain_healthy,
            chain_block_number,
            registry,
        }
    }

    fn refresh(&self, snapshot: &MetricsSnapshot, chains: &[ChainStatus], alerts: &AlertSink) {
        self.operations_retained.set(snapshot.total_ops as i64);
        self.operations_succeeded.set(snapshot.succeeded as i64);
        self.operations_failed.set(snapshot.failed as i64);
        self.operations_pending.set(snapshot.pending as i64);
        self.failure_rate.set(snapshot.failure_rate);
        self.average_latency_ms.set(snapshot.average_latency_ms);

        for level in AlertLevel::ALL {
            self.alerts_total
                .with_label_values(&[level.as_str()])
                .set(alerts.total(level) as i64);
        }

        for chain in chains {
            let label = chain.chain_id.to_string();
            self.chain_healthy
                .with_label_values(&[label.as_str()])
                .set(chain.healthy as i64);
            if let Some(block) = chain.last_block {
                self.chain_block_number
                    .with_label_values(&[label.as_str()])
                    .set(block as i64);
            }
        }
    }
}

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChainRegistry>,
    pub tracker: Arc<TransactionTracker>,
    pub aggregator: MetricsAggregator,
    pub alerts: Arc<AlertSink>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        registry: Arc<ChainRegistry>,
        tracker: Arc<TransactionTracker>,
        alerts: Arc<AlertSink>,
    ) -> Self {
        Self {
            registry,
            aggregator: MetricsAggregator::new(tracker.clone()),
            tracker,
            alerts,
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub chains: Vec<ChainStatus>,
    pub metrics: MetricsSnapshot,
}

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let chains = state.registry.statuses().await;
    let status = if chains.iter().all(|c| c.healthy) {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        chains,
        metrics: state.aggregator.snapshot().await,
    })
}

/// Liveness endpoint (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness endpoint, ready once every chain has been checked
async fn readiness(State(state): State<AppState>) -> Response {
    if state.registry.all_checked().await {
        "OK".into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response()
    }
}

async fn status(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.aggregator.snapshot().await)
}

#[derive(Debug, Default, Deserialize)]
pub struct OperationsQuery {
    pub status: Option<String>,
    pub chain_id: Option<ChainId>,
    /// Kind prefix, e.g. `governance` or `mirror_transaction`
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

async fn operations(
    State(state): State<AppState>,
    Query(query): Query<OperationsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<OperationStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let filter = OperationFilter {
        status,
        chain_id: query.chain_id,
        kind_prefix: query.kind,
    };
    let ops: Vec<TrackedOperation> = state
        .tracker
        .query(&filter)
        .await
        .into_iter()
        .take(query.limit.unwrap_or(DEFAULT_LIMIT))
        .collect();
    Json(ops).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

async fn alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Json<Vec<Alert>> {
    Json(
        state
            .alerts
            .history()
            .into_iter()
            .take(query.limit.unwrap_or(DEFAULT_LIMIT))
            .collect(),
    )
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let snapshot = state.aggregator.snapshot().await;
    let chains = state.registry.statuses().await;
    state.metrics.refresh(&snapshot, &chains, &state.alerts);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/operations", get(operations))
        .route("/alerts", get(alerts))
        .with_state(state)
}

/// Start the HTTP server for health, status and metrics
pub async fn start_server(bind_address: &str, port: u16, state: AppState) -> eyre::Result<()> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("Status server listening on {}", addr);
    info!("  /health     - Chains and metrics (JSON)");
    info!("  /operations - Tracked operations (JSON)");
    info!("  /metrics    - Prometheus metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
