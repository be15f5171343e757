//! Governance and mirror lifecycles against the contract-call boundary
//!
//! Governance actions move `Proposed -> Signing -> Executable -> Executed`
//! on the governance chain. Mirrored transactions are sent to the
//! destination chain's bridge and confirmed on a spawned task, which closes
//! the tracked operation and records the cross-chain latency.
//!
//! Every external call goes through the [`RetryExecutor`]. Once an operation
//! is tracked, any failure closes it as Failed with a reason and raises an
//! Error alert carrying the operation id, the chains involved and the error.

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertLevel, AlertSink};
use crate::chain::{
    decode_bool, decode_u64, ChainClient, ContractCall, Receipt, TxHandle, TRANSACTION_MIRRORED,
    TRANSACTION_PROPOSED,
};
use crate::error::{BridgeError, ChainError, Result};
use crate::registry::ChainRegistry;
use crate::retry::RetryExecutor;
use crate::tracker::{TransactionTracker, REASON_KEY};
use crate::types::{metadata, millis_between, ChainId, MetaValue, OperationKind};

/// Feature flag the bridge must have enabled for mirroring
pub const DEFAULT_MIRROR_FEATURE: &str = "mirroring";

/// Governance states kept before the oldest is dropped
pub const DEFAULT_GOVERNANCE_CACHE_SIZE: usize = 10_000;
const DEFAULT_GOVERNANCE_TTL: Duration = Duration::from_secs(86_400);

/// Which chains the coordinator acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Chain hosting the multisig governance contract
    pub governance_chain_id: ChainId,
    /// Chain whose bridge receives mirrored transactions
    pub destination_chain_id: ChainId,
    pub mirror_feature: String,
    /// Capacity of the local governance state cache
    pub governance_cache_size: usize,
    /// Age after which an untouched governance state is forgotten
    pub governance_ttl: Duration,
}

impl CoordinatorConfig {
    pub fn new(governance_chain_id: ChainId, destination_chain_id: ChainId) -> Self {
        Self {
            governance_chain_id,
            destination_chain_id,
            mirror_feature: DEFAULT_MIRROR_FEATURE.to_string(),
            governance_cache_size: DEFAULT_GOVERNANCE_CACHE_SIZE,
            governance_ttl: DEFAULT_GOVERNANCE_TTL,
        }
    }
}

/// Local view of a governance action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceState {
    Proposed,
    Signing,
    Executable,
    Executed,
}

/// Local governance states with TTL and capacity limits
///
/// An executed action stays visible until the next insert or eviction pass;
/// other states age out after the TTL. When full, the least recently updated entry
/// is evicted on insert.
#[derive(Debug)]
struct GovernanceCache {
    entries: HashMap<B256, (GovernanceState, DateTime<Utc>)>,
    max_size: usize,
    ttl: chrono::Duration,
}

impl GovernanceCache {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: max_size.max(1),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn get(&self, id: &B256) -> Option<GovernanceState> {
        self.entries.get(id).map(|(state, _)| *state)
    }

    fn insert(&mut self, id: B256, state: GovernanceState, now: DateTime<Utc>) {
        self.evict(now);
        while self.entries.len() >= self.max_size && !self.entries.contains_key(&id) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, updated))| *updated)
                .map(|(id, _)| *id);
            match oldest {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.entries.insert(id, (state, now));
    }

    /// Drop executed and expired entries
    fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (state, updated)| {
            *state != GovernanceState::Executed && now - *updated < ttl
        });
        before - self.entries.len()
    }
}

/// Signature progress read from the governance contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceStatus {
    pub operation_id: B256,
    pub signatures: u64,
    pub threshold: u64,
    pub executable: bool,
}

/// A mirrored transaction that has been sent but not yet confirmed
#[derive(Debug)]
pub struct MirrorSubmission {
    /// Tracker id of the operation
    pub operation_id: String,
    pub tx_handle: TxHandle,
    /// Resolves once the confirmation has been recorded in the tracker
    pub confirmation: JoinHandle<Result<MirrorOutcome>>,
}

/// A confirmed mirrored transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorOutcome {
    pub operation_id: String,
    pub tx_handle: TxHandle,
    pub block_number: u64,
    /// Confirmation time minus send time
    pub cross_chain_latency_ms: u64,
}

#[derive(Clone)]
pub struct BridgeCoordinator {
    config: CoordinatorConfig,
    registry: Arc<ChainRegistry>,
    tracker: Arc<TransactionTracker>,
    alerts: Arc<AlertSink>,
    executor: RetryExecutor,
    governance: Arc<Mutex<GovernanceCache>>,
    sequence: Arc<AtomicU64>,
}

impl BridgeCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ChainRegistry>,
        tracker: Arc<TransactionTracker>,
        alerts: Arc<AlertSink>,
        executor: RetryExecutor,
    ) -> Self {
        let governance = GovernanceCache::new(config.governance_cache_size, config.governance_ttl);
        Self {
            config,
            registry,
            tracker,
            alerts,
            executor,
            governance: Arc::new(Mutex::new(governance)),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Last known local state of a governance action
    pub fn governance_state(&self, operation_id: B256) -> Option<GovernanceState> {
        self.governance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&operation_id)
    }

    /// Number of governance actions with a cached local state
    pub fn governance_cache_len(&self) -> usize {
        self.governance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Forget executed and expired governance states; returns how many went
    pub fn evict_governance_states(&self) -> usize {
        self.evict_governance_states_at(Utc::now())
    }

    pub fn evict_governance_states_at(&self, now: DateTime<Utc>) -> usize {
        let removed = self
            .governance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evict(now);
        if removed > 0 {
            debug!(removed, "Evicted governance states");
        }
        removed
    }

    fn set_governance_state(&self, operation_id: B256, state: GovernanceState) {
        self.governance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation_id, state, Utc::now());
    }

    // ========================================================================
    // Governance
    // ========================================================================

    /// Propose an action and return the contract's operation id
    ///
    /// A proposal is not idempotent on chain: if a response is lost after
    /// submission, the retry creates a second proposal.
    pub async fn propose_governance_action(
        &self,
        target: Address,
        value: U256,
        payload: Bytes,
    ) -> Result<B256> {
        let chain_id = self.config.governance_chain_id;
        let client = self.registry.client(chain_id).await?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let tracking_id = format!("governance-propose:{}:{}", chain_id, seq);
        self.tracker
            .begin(
                tracking_id.clone(),
                OperationKind::GovernancePropose,
                chain_id,
                chain_id,
                metadata([
                    ("target", MetaValue::from(target.to_string())),
                    ("value", MetaValue::from(value.to_string())),
                    ("payloadBytes", MetaValue::from(payload.len())),
                ]),
            )
            .await?;

        let call = ContractCall::ProposeTransaction {
            target,
            value,
            data: payload,
        };
        let context = "propose governance action";
        let result = match self.submit(client.as_ref(), &call, context).await {
            Ok(receipt) => operation_id_from(&receipt, context).map(|id| (id, receipt)),
            Err(e) => Err(e),
        };

        match result {
            Ok((operation_id, receipt)) => {
                self.tracker
                    .complete(
                        &tracking_id,
                        true,
                        metadata([
                            ("operationId", MetaValue::from(operation_id.to_string())),
                            ("blockNumber", MetaValue::from(receipt.block_number)),
                        ]),
                    )
                    .await?;
                self.set_governance_state(operation_id, GovernanceState::Proposed);
                info!(
                    chain_id,
                    operation_id = %operation_id,
                    block = receipt.block_number,
                    "Governance action proposed"
                );
                Ok(operation_id)
            }
            Err(e) => {
                self.record_failure(&tracking_id, chain_id, chain_id, &e).await?;
                Err(e)
            }
        }
    }

    /// Add our signature and return the updated quorum status
    ///
    /// If an earlier attempt's signature landed but its response was lost,
    /// the retry is rejected with "already signed". That rejection on a
    /// retry attempt counts as success; on the first attempt it is a genuine
    /// duplicate and is surfaced.
    pub async fn sign_governance_action(&self, operation_id: B256) -> Result<GovernanceStatus> {
        let chain_id = self.config.governance_chain_id;
        let client = self.registry.client(chain_id).await?;
        let before = self.read_status(client.as_ref(), operation_id).await?;

        let tracking_id = format!("governance-sign:{}", operation_id);
        self.tracker
            .begin(
                tracking_id.clone(),
                OperationKind::GovernanceSign,
                chain_id,
                chain_id,
                metadata([("operationId", operation_id.to_string())]),
            )
            .await?;

        let call = ContractCall::SignTransaction {
            tx_hash: operation_id,
        };
        let mut recovered = false;
        match self
            .submit(client.as_ref(), &call, "sign governance action")
            .await
        {
            Ok(_) => {}
            Err(BridgeError::ContractRejection {
                attempt, reason, ..
            }) if attempt > 1 && is_already_signed(&reason) => {
                warn!(
                    operation_id = %operation_id,
                    attempt,
                    "Signature from an earlier attempt already landed"
                );
                recovered = true;
            }
            Err(e) => {
                self.record_failure(&tracking_id, chain_id, chain_id, &e).await?;
                return Err(e);
            }
        }

        self.tracker
            .complete(
                &tracking_id,
                true,
                metadata([("recoveredDuplicate", recovered)]),
            )
            .await?;

        let after = self.read_status(client.as_ref(), operation_id).await?;
        self.set_governance_state(
            operation_id,
            if after.executable {
                GovernanceState::Executable
            } else {
                GovernanceState::Signing
            },
        );
        info!(
            operation_id = %operation_id,
            signatures = after.signatures,
            threshold = after.threshold,
            "Governance action signed"
        );

        if !before.executable && after.executable {
            self.alerts.emit(
                Alert::new(
                    AlertLevel::Info,
                    format!("Governance action {} reached quorum", operation_id),
                )
                .with("operationId", operation_id.to_string())
                .with("signatures", after.signatures)
                .with("threshold", after.threshold)
                .with("chainId", chain_id),
            );
        }
        Ok(after)
    }

    /// Execute an action that has reached quorum
    pub async fn execute_governance_action(&self, operation_id: B256) -> Result<Receipt> {
        let chain_id = self.config.governance_chain_id;
        let client = self.registry.client(chain_id).await?;

        let status = self.read_status(client.as_ref(), operation_id).await?;
        if !status.executable {
            return Err(BridgeError::InsufficientSignatures {
                operation_id: operation_id.to_string(),
                signatures: status.signatures,
                threshold: status.threshold,
            });
        }

        let tracking_id = format!("governance-execute:{}", operation_id);
        self.tracker
            .begin(
                tracking_id.clone(),
                OperationKind::GovernanceExecute,
                chain_id,
                chain_id,
                metadata([
                    ("operationId", MetaValue::from(operation_id.to_string())),
                    ("signatures", MetaValue::from(status.signatures)),
                ]),
            )
            .await?;

        let call = ContractCall::ExecuteTransaction {
            tx_hash: operation_id,
        };
        match self
            .submit(client.as_ref(), &call, "execute governance action")
            .await
        {
            Ok(receipt) => {
                self.tracker
                    .complete(
                        &tracking_id,
                        true,
                        metadata([("blockNumber", receipt.block_number)]),
                    )
                    .await?;
                self.set_governance_state(operation_id, GovernanceState::Executed);
                info!(
                    operation_id = %operation_id,
                    block = receipt.block_number,
                    "Governance action executed"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.record_failure(&tracking_id, chain_id, chain_id, &e).await?;
                Err(e)
            }
        }
    }

    /// Signature count and threshold as the contract sees them now
    pub async fn governance_status(&self, operation_id: B256) -> Result<GovernanceStatus> {
        let client = self.registry.client(self.config.governance_chain_id).await?;
        self.read_status(client.as_ref(), operation_id).await
    }

    pub async fn has_role(&self, account: Address, role: B256) -> Result<bool> {
        let client = self.registry.client(self.config.governance_chain_id).await?;
        self.read(
            client.as_ref(),
            ContractCall::HasRole { account, role },
            "read role",
            decode_bool,
        )
        .await
    }

    async fn read_status(
        &self,
        client: &dyn ChainClient,
        operation_id: B256,
    ) -> Result<GovernanceStatus> {
        let signatures = self
            .read(
                client,
                ContractCall::GetSignatureCount {
                    tx_hash: operation_id,
                },
                "read signature count",
                decode_u64,
            )
            .await?;
        let threshold = self
            .read(client, ContractCall::GetThreshold, "read threshold", decode_u64)
            .await?;

        Ok(GovernanceStatus {
            operation_id,
            signatures,
            threshold,
            executable: signatures >= threshold,
        })
    }

    // ========================================================================
    // Mirroring
    // ========================================================================

    /// Send a mirrored transaction to the destination bridge
    ///
    /// Returns once the transaction is submitted. Confirmation runs on a
    /// spawned task that closes the tracked operation.
    pub async fn mirror_transaction(
        &self,
        source_chain_id: ChainId,
        source_address: Address,
        tx_hash: B256,
        payload: Bytes,
    ) -> Result<MirrorSubmission> {
        let destination = self.config.destination_chain_id;
        let client = self.registry.client(destination).await?;

        let supported = self
            .read(
                client.as_ref(),
                ContractCall::IsChainSupported {
                    chain_id: source_chain_id,
                },
                "check source chain support",
                decode_bool,
            )
            .await?;
        if !supported {
            return Err(BridgeError::UnsupportedChain(source_chain_id));
        }

        let enabled = self
            .read(
                client.as_ref(),
                ContractCall::IsFeatureEnabled {
                    name: self.config.mirror_feature.clone(),
                },
                "check mirror feature",
                decode_bool,
            )
            .await?;
        if !enabled {
            return Err(BridgeError::FeatureDisabled(self.config.mirror_feature.clone()));
        }

        let tracking_id = format!("mirror:{}:{}", source_chain_id, tx_hash);
        self.tracker
            .begin(
                tracking_id.clone(),
                OperationKind::MirrorTransaction,
                source_chain_id,
                destination,
                metadata([
                    ("sourceAddress", MetaValue::from(source_address.to_string())),
                    ("txHash", MetaValue::from(tx_hash.to_string())),
                    ("payloadBytes", MetaValue::from(payload.len())),
                ]),
            )
            .await?;

        let call = ContractCall::MirrorTransaction {
            source_chain_id,
            source_address,
            tx_hash,
            data: payload,
        };
        let sender: &dyn ChainClient = client.as_ref();
        let call_ref = &call;
        let sent = self
            .executor
            .execute("mirror transaction", move || sender.send(call_ref))
            .await;

        let tx_handle = match sent {
            Ok(handle) => handle,
            Err(e) => {
                self.record_failure(&tracking_id, source_chain_id, destination, &e)
                    .await?;
                return Err(e);
            }
        };
        let sent_at = Utc::now();
        info!(
            operation_id = %tracking_id,
            tx = %tx_handle.tx_hash,
            source_chain_id,
            destination_chain_id = destination,
            "Mirrored transaction sent"
        );

        let coordinator = self.clone();
        let operation_id = tracking_id.clone();
        let handle = tx_handle.clone();
        let confirmation = tokio::spawn(async move {
            coordinator
                .confirm_mirror(client, operation_id, handle, source_chain_id, sent_at)
                .await
        });

        Ok(MirrorSubmission {
            operation_id: tracking_id,
            tx_handle,
            confirmation,
        })
    }

    async fn confirm_mirror(
        &self,
        client: Arc<dyn ChainClient>,
        operation_id: String,
        handle: TxHandle,
        source_chain_id: ChainId,
        sent_at: DateTime<Utc>,
    ) -> Result<MirrorOutcome> {
        let destination = handle.chain_id;
        let context = "confirm mirrored transaction";
        let confirmer: &dyn ChainClient = client.as_ref();
        let handle_ref = &handle;

        let result = self
            .executor
            .execute(context, move || confirmer.await_confirmation(handle_ref))
            .await
            .and_then(|receipt| check_receipt(receipt, context))
            .and_then(|receipt| {
                if receipt.event(TRANSACTION_MIRRORED).is_none() {
                    return Err(BridgeError::MissingEvent {
                        context: context.to_string(),
                        event: TRANSACTION_MIRRORED,
                    });
                }
                Ok(receipt)
            });

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                self.record_failure(&operation_id, source_chain_id, destination, &e)
                    .await?;
                return Err(e);
            }
        };

        let confirmed_at = Utc::now();
        let latency = millis_between(sent_at, confirmed_at);
        self.tracker
            .complete_at(
                &operation_id,
                true,
                metadata([
                    ("blockNumber", receipt.block_number),
                    ("crossChainLatencyMs", latency),
                ]),
                confirmed_at,
            )
            .await?;

        info!(
            operation_id = %operation_id,
            block = receipt.block_number,
            latency_ms = latency,
            "Mirrored transaction confirmed"
        );

        Ok(MirrorOutcome {
            operation_id,
            tx_handle: handle,
            block_number: receipt.block_number,
            cross_chain_latency_ms: latency,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Send a state-changing call and wait for a successful receipt
    async fn submit(
        &self,
        client: &dyn ChainClient,
        call: &ContractCall,
        context: &str,
    ) -> Result<Receipt> {
        let handle = self
            .executor
            .execute(context, move || client.send(call))
            .await?;
        let handle = &handle;
        let receipt = self
            .executor
            .execute(context, move || client.await_confirmation(handle))
            .await?;
        check_receipt(receipt, context)
    }

    async fn read<T>(
        &self,
        client: &dyn ChainClient,
        call: ContractCall,
        context: &str,
        decode: fn(&[u8]) -> std::result::Result<T, ChainError>,
    ) -> Result<T> {
        let call = &call;
        self.executor
            .execute(context, move || async move {
                let raw = client.call(call).await?;
                decode(&raw)
            })
            .await
    }

    /// Close a tracked operation as Failed and alert on it
    async fn record_failure(
        &self,
        tracking_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        err: &BridgeError,
    ) -> Result<()> {
        let reason = err.to_string();
        self.tracker
            .complete(
                tracking_id,
                false,
                metadata([
                    (REASON_KEY, MetaValue::from(reason.clone())),
                    ("errorKind", MetaValue::from(err.kind())),
                ]),
            )
            .await?;

        error!(
            operation_id = %tracking_id,
            source_chain_id,
            destination_chain_id,
            error = %err,
            "Operation failed"
        );
        self.alerts.emit(
            Alert::new(
                AlertLevel::Error,
                format!("Operation {} failed: {}", tracking_id, reason),
            )
            .with("operationId", tracking_id)
            .with("sourceChainId", source_chain_id)
            .with("destinationChainId", destination_chain_id)
            .with("errorKind", err.kind())
            .with("error", reason),
        );
        Ok(())
    }
}

fn is_already_signed(reason: &str) -> bool {
    reason.to_lowercase().contains("already signed")
}

fn check_receipt(receipt: Receipt, context: &str) -> Result<Receipt> {
    if receipt.success {
        Ok(receipt)
    } else {
        Err(BridgeError::ContractRejection {
            context: context.to_string(),
            attempt: 1,
            reason: format!("transaction reverted in block {}", receipt.block_number),
        })
    }
}

fn operation_id_from(receipt: &Receipt, context: &str) -> Result<B256> {
    let missing = || BridgeError::MissingEvent {
        context: context.to_string(),
        event: TRANSACTION_PROPOSED,
    };
    let raw = receipt
        .event(TRANSACTION_PROPOSED)
        .and_then(|e| e.arg_str("txHash"))
        .ok_or_else(missing)?;
    raw.parse::<B256>().map_err(|e| BridgeError::Chain {
        context: context.to_string(),
        source: ChainError::Decode(format!("invalid txHash {}: {}", raw, e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChainEntry;
    use crate::retry::RetryPolicy;
    use crate::testing::MockChainClient;
    use crate::types::OperationStatus;
    use std::time::Duration;

    struct Harness {
        coordinator: BridgeCoordinator,
        chain: Arc<MockChainClient>,
        tracker: Arc<TransactionTracker>,
        alerts: Arc<AlertSink>,
    }

    async fn harness() -> Harness {
        let alerts = Arc::new(AlertSink::default());
        let registry = Arc::new(ChainRegistry::new(alerts.clone()));
        let tracker = Arc::new(TransactionTracker::new());
        let chain = Arc::new(MockChainClient::new(1));
        registry
            .register(ChainEntry::new(1, "home", chain.clone(), 1))
            .await;

        let executor = RetryExecutor::new(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
        ));
        let coordinator = BridgeCoordinator::new(
            CoordinatorConfig::new(1, 1),
            registry,
            tracker.clone(),
            alerts.clone(),
            executor,
        );
        Harness {
            coordinator,
            chain,
            tracker,
            alerts,
        }
    }

    async fn propose(h: &Harness) -> B256 {
        h.coordinator
            .propose_governance_action(Address::ZERO, U256::ZERO, Bytes::from_static(b"upgrade"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_propose_returns_contract_id() {
        let h = harness().await;
        let id = propose(&h).await;
        assert_eq!(h.coordinator.governance_state(id), Some(GovernanceState::Proposed));

        let ops = h.tracker.all().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OperationStatus::Completed);
        assert_eq!(ops[0].metadata["operationId"].as_str(), Some(id.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_sign_reaching_quorum_alerts_once() {
        let h = harness().await;
        h.chain.set_threshold(2);
        let id = propose(&h).await;
        h.chain.add_signature(id);

        let status = h.coordinator.sign_governance_action(id).await.unwrap();
        assert_eq!(status.signatures, 2);
        assert!(status.executable);
        assert_eq!(h.coordinator.governance_state(id), Some(GovernanceState::Executable));

        let quorum: Vec<_> = h
            .alerts
            .history()
            .into_iter()
            .filter(|a| a.message.contains("reached quorum"))
            .collect();
        assert_eq!(quorum.len(), 1);
        assert_eq!(quorum[0].level, AlertLevel::Info);
    }

    #[tokio::test]
    async fn test_sign_below_quorum_is_signing() {
        let h = harness().await;
        h.chain.set_threshold(3);
        let id = propose(&h).await;

        let status = h.coordinator.sign_governance_action(id).await.unwrap();
        assert!(!status.executable);
        assert_eq!(h.coordinator.governance_state(id), Some(GovernanceState::Signing));
        assert!(h.alerts.history().is_empty());
    }

    #[tokio::test]
    async fn test_retried_sign_already_signed_is_success() {
        let h = harness().await;
        let id = propose(&h).await;
        h.chain.lose_next_send_responses(1);

        let status = h.coordinator.sign_governance_action(id).await.unwrap();
        assert_eq!(status.signatures, 1);
        assert_eq!(h.chain.sent_count("signTransaction"), 2);

        let op = h.tracker.get(&format!("governance-sign:{}", id)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.metadata["recoveredDuplicate"].as_bool(), Some(true));
    }

    #[tokio::test]
    async fn test_first_attempt_duplicate_sign_is_surfaced() {
        let h = harness().await;
        h.chain.set_threshold(2);
        let id = propose(&h).await;
        h.coordinator.sign_governance_action(id).await.unwrap();

        let err = h.coordinator.sign_governance_action(id).await.unwrap_err();
        assert!(matches!(err, BridgeError::ContractRejection { attempt: 1, .. }));

        let op = h.tracker.get(&format!("governance-sign:{}", id)).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.failure_reason().unwrap().contains("already signed"));
    }

    #[tokio::test]
    async fn test_execute_without_quorum_fails_locally() {
        let h = harness().await;
        h.chain.set_threshold(2);
        let id = propose(&h).await;
        let tracked_before = h.tracker.len().await;

        let err = h.coordinator.execute_governance_action(id).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InsufficientSignatures {
                signatures: 0,
                threshold: 2,
                ..
            }
        ));
        assert_eq!(h.chain.sent_count("executeTransaction"), 0);
        assert_eq!(h.tracker.len().await, tracked_before);
    }

    #[tokio::test]
    async fn test_full_governance_lifecycle() {
        let h = harness().await;
        let id = propose(&h).await;
        h.coordinator.sign_governance_action(id).await.unwrap();
        h.coordinator.execute_governance_action(id).await.unwrap();

        assert!(h.chain.is_executed(id));
        assert_eq!(h.coordinator.governance_state(id), Some(GovernanceState::Executed));
        assert_eq!(h.tracker.len().await, 3);
    }

    #[tokio::test]
    async fn test_executed_governance_states_are_evicted() {
        let h = harness().await;
        let mut ids = Vec::new();
        for _ in 0..20 {
            let id = propose(&h).await;
            h.coordinator.sign_governance_action(id).await.unwrap();
            h.coordinator.execute_governance_action(id).await.unwrap();
            ids.push(id);
        }
        // Each insert clears the executed entries written before it
        assert_eq!(h.coordinator.governance_cache_len(), 1);

        let pending = propose(&h).await;
        let later = Utc::now() + chrono::Duration::seconds(1);
        h.coordinator.evict_governance_states_at(later);
        assert_eq!(h.coordinator.governance_cache_len(), 1);
        assert_eq!(h.coordinator.governance_state(pending), Some(GovernanceState::Proposed));
        assert_eq!(h.coordinator.governance_state(ids[19]), None);

        let expired = Utc::now() + chrono::Duration::days(2);
        assert_eq!(h.coordinator.evict_governance_states_at(expired), 1);
        assert_eq!(h.coordinator.governance_cache_len(), 0);
    }

    #[test]
    fn test_governance_cache_capacity() {
        let mut cache = GovernanceCache::new(3, Duration::from_secs(3600));
        let start = Utc::now();
        for i in 0..5u8 {
            cache.insert(
                B256::with_last_byte(i),
                GovernanceState::Signing,
                start + chrono::Duration::seconds(i as i64),
            );
        }
        assert_eq!(cache.entries.len(), 3);
        assert_eq!(cache.get(&B256::with_last_byte(0)), None);
        assert_eq!(cache.get(&B256::with_last_byte(1)), None);
        assert_eq!(cache.get(&B256::with_last_byte(4)), Some(GovernanceState::Signing));
    }

    #[tokio::test]
    async fn test_has_role_passthrough() {
        let h = harness().await;
        let account = Address::with_last_byte(7);
        let role = B256::with_last_byte(1);
        assert!(!h.coordinator.has_role(account, role).await.unwrap());
        h.chain.grant_role(account, role);
        assert!(h.coordinator.has_role(account, role).await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_propose_is_tracked_and_alerted() {
        let h = harness().await;
        for _ in 0..3 {
            h.chain
                .fail_next_send(ChainError::Transport("connection reset".into()));
        }

        let err = h
            .coordinator
            .propose_governance_action(Address::ZERO, U256::ZERO, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::OperationExhausted { attempts: 3, .. }));

        let op = &h.tracker.all().await[0];
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.metadata["errorKind"].as_str(), Some("operation_exhausted"));

        let alert = &h.alerts.history_at_least(AlertLevel::Error)[0];
        assert_eq!(alert.metadata["operationId"].as_str(), Some(op.id.as_str()));
        assert!(alert.metadata.contains_key("error"));
    }

    #[tokio::test]
    async fn test_unknown_governance_chain() {
        let h = harness().await;
        let mut config = h.coordinator.config().clone();
        config.governance_chain_id = 99;
        let coordinator = BridgeCoordinator::new(
            config,
            h.coordinator.registry.clone(),
            h.tracker.clone(),
            h.alerts.clone(),
            h.coordinator.executor.clone(),
        );
        let err = coordinator.governance_status(B256::ZERO).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownChain(99)));
    }
}
