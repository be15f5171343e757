//! Threshold rules over metrics and tracker state
//!
//! Rules are evaluated independently on every call. The only state the
//! detector keeps is the cooldown table, keyed by rule and subject, which
//! suppresses repeats of an alert category while its condition persists.
//! The subject is the operation id for stuck operations, the sorted set of
//! affected chains for failure bursts, and empty for the other aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

use crate::alerts::{Alert, AlertLevel};
use crate::metrics::MetricsSnapshot;
use crate::tracker::TrackedOperation;
use crate::types::{millis_between, ChainId, MetaValue, Metadata, OperationStatus};

/// Window for the failure-burst rule
pub const FAILURE_WINDOW_MS: u64 = 60_000;

/// Alert thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Rule 1, strict `>` comparison
    pub failure_rate_threshold: f64,
    /// Rule 2, failures in the last minute, `>=` comparison
    pub max_failures_per_minute: u64,
    /// Rule 3, average latency of completed operations
    pub response_time_threshold_ms: u64,
    /// Rule 4, age of a still-pending operation
    pub cross_chain_latency_threshold_ms: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.1,
            max_failures_per_minute: 5,
            response_time_threshold_ms: 30_000,
            cross_chain_latency_threshold_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Rule {
    FailureRate,
    FailureBurst,
    ResponseTime,
    StuckOperation,
}

impl Rule {
    fn as_str(&self) -> &'static str {
        match self {
            Rule::FailureRate => "failure_rate",
            Rule::FailureBurst => "failure_burst",
            Rule::ResponseTime => "response_time",
            Rule::StuckOperation => "stuck_operation",
        }
    }
}

/// Cooldown key; rate and latency rules use an empty subject
type CooldownKey = (Rule, String);

#[derive(Debug)]
pub struct AnomalyDetector {
    cooldown: chrono::Duration,
    last_emitted: HashMap<CooldownKey, DateTime<Utc>>,
}

impl AnomalyDetector {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last_emitted: HashMap::new(),
        }
    }

    pub fn evaluate(
        &mut self,
        snapshot: &MetricsSnapshot,
        ops: &[TrackedOperation],
        thresholds: &Thresholds,
    ) -> Vec<Alert> {
        self.evaluate_at(snapshot, ops, thresholds, Utc::now())
    }

    pub fn evaluate_at(
        &mut self,
        snapshot: &MetricsSnapshot,
        ops: &[TrackedOperation],
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        self.prune_cooldowns(now);
        let mut alerts = Vec::new();

        // 1. Failure rate
        if snapshot.failure_rate > thresholds.failure_rate_threshold {
            self.push(&mut alerts, Rule::FailureRate, String::new(), now, || {
                Alert::at(
                    AlertLevel::Warning,
                    format!(
                        "High failure rate: {:.2}% (threshold {:.2}%)",
                        snapshot.failure_rate * 100.0,
                        thresholds.failure_rate_threshold * 100.0
                    ),
                    now,
                )
                .with("failureRate", snapshot.failure_rate)
                .with("threshold", thresholds.failure_rate_threshold)
                .with("failed", snapshot.failed)
                .with("succeeded", snapshot.succeeded)
            });
        }

        // 2. Failure burst in the last minute
        let recent_failures: Vec<&TrackedOperation> = ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .filter(|op| {
                op.end_time
                    .is_some_and(|end| millis_between(end, now) <= FAILURE_WINDOW_MS)
            })
            .collect();
        let count = recent_failures.len() as u64;
        if count > 0 && count >= thresholds.max_failures_per_minute {
            let mut per_chain: BTreeMap<ChainId, u64> = BTreeMap::new();
            for op in &recent_failures {
                *per_chain.entry(op.source_chain_id).or_insert(0) += 1;
            }
            let chain_ids: BTreeSet<ChainId> = per_chain.keys().copied().collect();
            let chain_list = chain_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");

            self.push(&mut alerts, Rule::FailureBurst, chain_list.clone(), now, || {
                let per_chain_meta: Metadata = per_chain
                    .iter()
                    .map(|(id, n)| (id.to_string(), MetaValue::from(*n)))
                    .collect();
                Alert::at(
                    AlertLevel::Critical,
                    format!(
                        "{} failures in the last minute (threshold {}) on chains [{}]",
                        count, thresholds.max_failures_per_minute, chain_list
                    ),
                    now,
                )
                .with("recentFailures", count)
                .with("threshold", thresholds.max_failures_per_minute)
                .with("chainIds", chain_list.clone())
                .with("failuresByChain", per_chain_meta)
            });
        }

        // 3. Average latency
        if snapshot.average_latency_ms > thresholds.response_time_threshold_ms as f64 {
            self.push(&mut alerts, Rule::ResponseTime, String::new(), now, || {
                Alert::at(
                    AlertLevel::Warning,
                    format!(
                        "High average latency: {:.0}ms (threshold {}ms)",
                        snapshot.average_latency_ms, thresholds.response_time_threshold_ms
                    ),
                    now,
                )
                .with("averageLatencyMs", snapshot.average_latency_ms)
                .with("threshold", thresholds.response_time_threshold_ms)
            });
        }

        // 4. Operations pending for too long, one alert per operation
        for op in ops
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .filter(|op| op.age_ms(now) > thresholds.cross_chain_latency_threshold_ms)
        {
            self.push(&mut alerts, Rule::StuckOperation, op.id.clone(), now, || {
                Alert::at(
                    AlertLevel::Warning,
                    format!(
                        "High latency: operation {} pending for {}ms",
                        op.id,
                        op.age_ms(now)
                    ),
                    now,
                )
                .with("operationId", op.id.clone())
                .with("kind", op.kind.as_str())
                .with("sourceChainId", op.source_chain_id)
                .with("destinationChainId", op.destination_chain_id)
                .with("pendingMs", op.age_ms(now))
                .with("threshold", thresholds.cross_chain_latency_threshold_ms)
            });
        }

        alerts
    }

    fn push<F>(
        &mut self,
        alerts: &mut Vec<Alert>,
        rule: Rule,
        subject: String,
        now: DateTime<Utc>,
        build: F,
    ) where
        F: FnOnce() -> Alert,
    {
        let key = (rule, subject);
        if let Some(last) = self.last_emitted.get(&key) {
            if now - *last < self.cooldown {
                debug!(rule = rule.as_str(), subject = %key.1, "Alert suppressed by cooldown");
                return;
            }
        }
        self.last_emitted.insert(key, now);
        alerts.push(build().with("rule", rule.as_str()));
    }

    /// Forget cooldowns that can no longer suppress anything
    fn prune_cooldowns(&mut self, now: DateTime<Utc>) {
        let cooldown = self.cooldown;
        self.last_emitted.retain(|_, last| now - *last < cooldown);
    }

    /// Number of alert categories currently cooling down
    pub fn active_cooldowns(&self) -> usize {
        self.last_emitted.len()
    }
}
