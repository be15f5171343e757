//! In-memory registry of in-flight cross-chain operations
//!
//! The tracker is the single source of truth for operation state. Every
//! status change is a check-then-act under one write lock, so two concurrent
//! `complete` calls on the same id can never both succeed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::types::{millis_between, ChainId, Metadata, OperationKind, OperationStatus};

/// Metadata key holding the human-readable failure reason
pub const REASON_KEY: &str = "reason";

/// One tracked governance or mirror operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedOperation {
    pub id: String,
    pub kind: OperationKind,
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub start_time: DateTime<Utc>,
    /// Set iff the status is terminal
    pub end_time: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    pub metadata: Metadata,
}

impl TrackedOperation {
    /// Wall-clock duration of a finished operation
    pub fn latency_ms(&self) -> Option<u64> {
        self.end_time.map(|end| millis_between(self.start_time, end))
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        millis_between(self.start_time, now)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self.status {
            OperationStatus::Failed => self.metadata.get(REASON_KEY).and_then(|v| v.as_str()),
            _ => None,
        }
    }

    pub fn involves_chain(&self, chain_id: ChainId) -> bool {
        self.source_chain_id == chain_id || self.destination_chain_id == chain_id
    }
}

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    /// Matches either the source or the destination chain
    pub chain_id: Option<ChainId>,
    /// Prefix of the kind name, e.g. `governance` or `mirror`
    pub kind_prefix: Option<String>,
}

impl OperationFilter {
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_chain(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn with_kind_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kind_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, op: &TrackedOperation) -> bool {
        if let Some(status) = self.status {
            if op.status != status {
                return false;
            }
        }
        if let Some(chain_id) = self.chain_id {
            if !op.involves_chain(chain_id) {
                return false;
            }
        }
        if let Some(prefix) = &self.kind_prefix {
            if !op.kind.as_str().starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Concurrent operation map
#[derive(Debug, Default)]
pub struct TransactionTracker {
    operations: RwLock<HashMap<String, TrackedOperation>>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an operation as Pending
    pub async fn begin(
        &self,
        id: impl Into<String>,
        kind: OperationKind,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        metadata: Metadata,
    ) -> Result<TrackedOperation> {
        self.begin_at(id, kind, source_chain_id, destination_chain_id, metadata, Utc::now())
            .await
    }

    pub async fn begin_at(
        &self,
        id: impl Into<String>,
        kind: OperationKind,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<TrackedOperation> {
        let id = id.into();
        let mut operations = self.operations.write().await;

        // A terminal entry with the same id is replaced; a pending one is a conflict
        if let Some(existing) = operations.get(&id) {
            if existing.status == OperationStatus::Pending {
                return Err(BridgeError::DuplicateId(id));
            }
        }

        let op = TrackedOperation {
            id: id.clone(),
            kind,
            source_chain_id,
            destination_chain_id,
            start_time: now,
            end_time: None,
            status: OperationStatus::Pending,
            metadata,
        };
        operations.insert(id, op.clone());

        debug!(
            operation_id = %op.id,
            kind = %kind,
            source_chain_id,
            destination_chain_id,
            "Tracking operation"
        );
        Ok(op)
    }

    /// Move a Pending operation to Completed or Failed, merging `metadata`
    pub async fn complete(
        &self,
        id: &str,
        success: bool,
        metadata: Metadata,
    ) -> Result<TrackedOperation> {
        self.complete_at(id, success, metadata, Utc::now()).await
    }

    pub async fn complete_at(
        &self,
        id: &str,
        success: bool,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<TrackedOperation> {
        let mut operations = self.operations.write().await;
        let op = operations
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownOperation(id.to_string()))?;

        if op.status.is_terminal() {
            return Err(BridgeError::AlreadyTerminal {
                id: id.to_string(),
                status: op.status,
            });
        }

        op.status = if success {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        };
        // Never before start, even if the clock stepped back
        op.end_time = Some(now.max(op.start_time));
        op.metadata.extend(metadata);

        info!(
            operation_id = %op.id,
            kind = %op.kind,
            status = %op.status,
            latency_ms = op.latency_ms().unwrap_or_default(),
            "Operation finished"
        );
        Ok(op.clone())
    }

    pub async fn get(&self, id: &str) -> Option<TrackedOperation> {
        self.operations.read().await.get(id).cloned()
    }

    /// Matching operations, newest first
    pub async fn query(&self, filter: &OperationFilter) -> Vec<TrackedOperation> {
        let mut ops: Vec<TrackedOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
        ops
    }

    pub async fn all(&self) -> Vec<TrackedOperation> {
        self.query(&OperationFilter::default()).await
    }

    pub async fn len(&self) -> usize {
        self.operations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.operations.read().await.is_empty()
    }

    /// Remove terminal operations that ended more than `max_age` ago
    ///
    /// Pending operations are kept regardless of age.
    pub async fn evict(&self, max_age: Duration) -> usize {
        self.evict_at(max_age, Utc::now()).await
    }

    pub async fn evict_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age_ms = max_age.as_millis() as u64;
        let mut operations = self.operations.write().await;
        let before = operations.len();
        operations.retain(|_, op| match op.end_time {
            Some(end) => millis_between(end, now) <= max_age_ms,
            None => true,
        });
        let evicted = before - operations.len();
        if evicted > 0 {
            debug!(evicted, remaining = operations.len(), "Evicted finished operations");
        }
        evicted
    }

    /// Operator action: drop an operation regardless of status
    pub async fn remove(&self, id: &str) -> Result<TrackedOperation> {
        let removed = self
            .operations
            .write()
            .await
            .remove(id)
            .ok_or_else(|| BridgeError::UnknownOperation(id.to_string()))?;
        info!(operation_id = %id, status = %removed.status, "Operation removed by operator");
        Ok(removed)
    }
}
