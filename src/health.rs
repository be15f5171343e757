//! Periodic chain liveness checks

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::ChainError;
use crate::registry::{ChainEntry, ChainRegistry};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::types::ChainId;

/// Result of one liveness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHealth {
    pub chain_id: ChainId,
    pub healthy: bool,
    pub block_number: Option<u64>,
    pub error: Option<String>,
}

pub struct HealthMonitor {
    registry: Arc<ChainRegistry>,
    executor: RetryExecutor,
    interval: Duration,
    check_timeout: Duration,
}

impl HealthMonitor {
    /// Checks are single-attempt so a slow chain is marked unhealthy quickly
    pub fn new(registry: Arc<ChainRegistry>, interval: Duration, check_timeout: Duration) -> Self {
        Self {
            registry,
            executor: RetryExecutor::new(RetryPolicy::single_attempt()),
            interval,
            check_timeout,
        }
    }

    /// Check every registered chain concurrently and record the results
    pub async fn check_all(&self) -> Vec<ChainHealth> {
        let entries = self.registry.entries().await;
        let results = join_all(entries.iter().map(|entry| self.check_chain(entry))).await;

        for health in &results {
            let outcome = match (&health.block_number, &health.error) {
                (Some(block), _) => Ok(*block),
                (None, Some(e)) => Err(e.clone()),
                (None, None) => Err("no block number".to_string()),
            };
            if let Err(e) = self.registry.record_check(health.chain_id, outcome).await {
                // Chain was removed between listing and recording
                debug!(chain_id = health.chain_id, error = %e, "Skipping health update");
            }
        }
        results
    }

    async fn check_chain(&self, entry: &ChainEntry) -> ChainHealth {
        let client = entry.client.as_ref();
        let timeout = self.check_timeout;
        let context = format!("health check chain {}", entry.chain_id);

        let result = self
            .executor
            .execute(&context, move || async move {
                tokio::time::timeout(timeout, client.get_block_number())
                    .await
                    .map_err(|_| ChainError::Timeout(timeout))?
            })
            .await;

        match result {
            Ok(block) => {
                debug!(chain_id = entry.chain_id, block, "Chain healthy");
                ChainHealth {
                    chain_id: entry.chain_id,
                    healthy: true,
                    block_number: Some(block),
                    error: None,
                }
            }
            Err(e) => ChainHealth {
                chain_id: entry.chain_id,
                healthy: false,
                block_number: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Check immediately, then on every interval until shutdown
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Health monitor starting");
        self.check_all().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    let results = self.check_all().await;
                    let unhealthy = results.iter().filter(|h| !h.healthy).count();
                    if unhealthy > 0 {
                        error!(unhealthy, total = results.len(), "Unhealthy chains");
                    }
                }
            }
        }
    }
}
