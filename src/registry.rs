//! Per-chain connection config and liveness state

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::chain::ChainClient;
use crate::error::{BridgeError, Result};
use crate::types::ChainId;

/// A configured chain and what we last saw of it
#[derive(Clone)]
pub struct ChainEntry {
    pub chain_id: ChainId,
    pub name: String,
    pub client: Arc<dyn ChainClient>,
    pub required_confirmations: u64,
    /// Written only by health checks
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_block: Option<u64>,
    pub last_error: Option<String>,
}

impl ChainEntry {
    pub fn new(
        chain_id: ChainId,
        name: impl Into<String>,
        client: Arc<dyn ChainClient>,
        required_confirmations: u64,
    ) -> Self {
        Self {
            chain_id,
            name: name.into(),
            client,
            required_confirmations,
            healthy: true,
            last_check: None,
            last_block: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            chain_id: self.chain_id,
            name: self.name.clone(),
            required_confirmations: self.required_confirmations,
            healthy: self.healthy,
            last_check: self.last_check,
            last_block: self.last_block,
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEntry")
            .field("chain_id", &self.chain_id)
            .field("name", &self.name)
            .field("required_confirmations", &self.required_confirmations)
            .field("healthy", &self.healthy)
            .field("last_check", &self.last_check)
            .field("last_block", &self.last_block)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a [`ChainEntry`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub chain_id: ChainId,
    pub name: String,
    pub required_confirmations: u64,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_block: Option<u64>,
    pub last_error: Option<String>,
}

/// Owner of all chain entries
pub struct ChainRegistry {
    chains: RwLock<BTreeMap<ChainId, ChainEntry>>,
    alerts: Arc<AlertSink>,
}

impl ChainRegistry {
    pub fn new(alerts: Arc<AlertSink>) -> Self {
        Self {
            chains: RwLock::new(BTreeMap::new()),
            alerts,
        }
    }

    /// Add or replace a chain entry
    pub async fn register(&self, entry: ChainEntry) {
        info!(
            chain_id = entry.chain_id,
            name = %entry.name,
            confirmations = entry.required_confirmations,
            "Registered chain"
        );
        self.chains.write().await.insert(entry.chain_id, entry);
    }

    pub async fn get(&self, chain_id: ChainId) -> Result<ChainEntry> {
        self.chains
            .read()
            .await
            .get(&chain_id)
            .cloned()
            .ok_or(BridgeError::UnknownChain(chain_id))
    }

    pub async fn client(&self, chain_id: ChainId) -> Result<Arc<dyn ChainClient>> {
        self.chains
            .read()
            .await
            .get(&chain_id)
            .map(|entry| entry.client.clone())
            .ok_or(BridgeError::UnknownChain(chain_id))
    }

    pub async fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.read().await.keys().copied().collect()
    }

    pub async fn entries(&self) -> Vec<ChainEntry> {
        self.chains.read().await.values().cloned().collect()
    }

    pub async fn statuses(&self) -> Vec<ChainStatus> {
        self.chains
            .read()
            .await
            .values()
            .map(ChainEntry::status)
            .collect()
    }

    /// True once every chain has been checked at least once
    pub async fn all_checked(&self) -> bool {
        self.chains
            .read()
            .await
            .values()
            .all(|entry| entry.last_check.is_some())
    }

    /// Update liveness, alerting only when the state flips
    pub async fn set_health(&self, chain_id: ChainId, healthy: bool) -> Result<()> {
        self.update(chain_id, healthy, None, None).await
    }

    /// Record the outcome of a liveness check
    pub async fn record_check(
        &self,
        chain_id: ChainId,
        outcome: std::result::Result<u64, String>,
    ) -> Result<()> {
        match outcome {
            Ok(block) => self.update(chain_id, true, Some(block), None).await,
            Err(reason) => self.update(chain_id, false, None, Some(reason)).await,
        }
    }

    async fn update(
        &self,
        chain_id: ChainId,
        healthy: bool,
        block: Option<u64>,
        error: Option<String>,
    ) -> Result<()> {
        let transition = {
            let mut chains = self.chains.write().await;
            let entry = chains
                .get_mut(&chain_id)
                .ok_or(BridgeError::UnknownChain(chain_id))?;

            let was_healthy = entry.healthy;
            entry.healthy = healthy;
            entry.last_check = Some(Utc::now());
            if block.is_some() {
                entry.last_block = block;
            }
            entry.last_error = if healthy { None } else { error.clone() };

            (was_healthy != healthy).then(|| entry.name.clone())
        };

        // Emit after the lock is released so subscribers can read the registry
        if let Some(name) = transition {
            let alert = if healthy {
                info!(chain_id, name = %name, "Chain recovered");
                Alert::new(AlertLevel::Info, format!("Chain {} recovered", name))
            } else {
                warn!(chain_id, name = %name, error = ?error, "Chain unhealthy");
                let mut alert =
                    Alert::new(AlertLevel::Error, format!("Chain {} is unhealthy", name));
                if let Some(reason) = error {
                    alert = alert.with("error", reason);
                }
                alert
            };
            self.alerts.emit(alert.with("chainId", chain_id));
        }
        Ok(())
    }
}
