//! Scripted in-memory chain client
//!
//! [`MockChainClient`] models just enough of the governance and bridge
//! contracts to drive the coordinator without a node: proposals, signature
//! counting against a threshold, execution, mirroring with supported-chain
//! and feature checks, and the events the coordinator reads. Failures can be
//! queued per entry point to exercise retry and alert paths.

use alloy::primitives::{keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::chain::{
    encode_bool, encode_u64, ChainClient, ChainEvent, ContractCall, Receipt, TxHandle,
    TRANSACTION_MIRRORED, TRANSACTION_PROPOSED,
};
use crate::error::ChainError;
use crate::types::{metadata, ChainId, MetaValue};

#[derive(Debug, Default)]
struct MockState {
    block_number: u64,
    nonce: u64,
    threshold: u64,

    // Governance
    signatures: HashMap<B256, u64>,
    signed_by_us: HashSet<B256>,
    executed: HashSet<B256>,
    roles: HashSet<(Address, B256)>,

    // Bridge
    supported_chains: HashSet<ChainId>,
    features: HashSet<String>,
    mirrored: HashSet<B256>,

    receipts: HashMap<B256, Receipt>,

    // Scripted faults
    offline: bool,
    send_failures: VecDeque<ChainError>,
    call_failures: VecDeque<ChainError>,
    confirmation_failures: VecDeque<ChainError>,
    block_failures: VecDeque<ChainError>,
    lost_send_responses: u32,
    revert_next_receipt: bool,
    block_delay: Option<Duration>,
    confirmation_delay: Option<Duration>,

    // Recorded traffic
    sent: Vec<ContractCall>,
    calls: Vec<ContractCall>,
}

/// In-memory [`ChainClient`] for tests and dry runs
#[derive(Debug)]
pub struct MockChainClient {
    chain_id: ChainId,
    sender: Address,
    state: Mutex<MockState>,
}

impl MockChainClient {
    /// A chain at block 1 with a signature threshold of 1
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            sender: Address::with_last_byte(0xaa),
            state: Mutex::new(MockState {
                block_number: 1,
                threshold: 1,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    // ------------------------------------------------------------------
    // Contract state
    // ------------------------------------------------------------------

    pub fn set_threshold(&self, threshold: u64) {
        self.state().threshold = threshold;
    }

    /// Simulate a signature from another signer
    pub fn add_signature(&self, tx_hash: B256) {
        *self.state().signatures.entry(tx_hash).or_insert(0) += 1;
    }

    pub fn signature_count(&self, tx_hash: B256) -> u64 {
        self.state().signatures.get(&tx_hash).copied().unwrap_or(0)
    }

    pub fn is_executed(&self, tx_hash: B256) -> bool {
        self.state().executed.contains(&tx_hash)
    }

    pub fn support_chain(&self, chain_id: ChainId) {
        self.state().supported_chains.insert(chain_id);
    }

    pub fn enable_feature(&self, name: &str) {
        self.state().features.insert(name.to_string());
    }

    pub fn disable_feature(&self, name: &str) {
        self.state().features.remove(name);
    }

    pub fn grant_role(&self, account: Address, role: B256) {
        self.state().roles.insert((account, role));
    }

    pub fn is_mirrored(&self, tx_hash: B256) -> bool {
        self.state().mirrored.contains(&tx_hash)
    }

    pub fn set_block_number(&self, block: u64) {
        self.state().block_number = block;
    }

    // ------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------

    /// Every entry point fails with a transport error while offline
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn fail_next_send(&self, error: ChainError) {
        self.state().send_failures.push_back(error);
    }

    pub fn fail_next_call(&self, error: ChainError) {
        self.state().call_failures.push_back(error);
    }

    pub fn fail_next_confirmation(&self, error: ChainError) {
        self.state().confirmation_failures.push_back(error);
    }

    pub fn fail_next_block_number(&self, error: ChainError) {
        self.state().block_failures.push_back(error);
    }

    /// The next `n` sends take effect on chain but the caller sees a
    /// transport error, as when a response is lost after submission
    pub fn lose_next_send_responses(&self, n: u32) {
        self.state().lost_send_responses = n;
    }

    /// The next confirmed receipt reports a failed execution
    pub fn revert_next_receipt(&self) {
        self.state().revert_next_receipt = true;
    }

    pub fn set_block_delay(&self, delay: Option<Duration>) {
        self.state().block_delay = delay;
    }

    pub fn set_confirmation_delay(&self, delay: Option<Duration>) {
        self.state().confirmation_delay = delay;
    }

    // ------------------------------------------------------------------
    // Recorded traffic
    // ------------------------------------------------------------------

    pub fn sent(&self) -> Vec<ContractCall> {
        self.state().sent.clone()
    }

    /// Number of sends for the given contract method
    pub fn sent_count(&self, method: &str) -> usize {
        self.state()
            .sent
            .iter()
            .filter(|c| c.method() == method)
            .count()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method() == method)
            .count()
    }

    fn apply(
        &self,
        state: &mut MockState,
        call: &ContractCall,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        match call {
            ContractCall::ProposeTransaction {
                target,
                value,
                data,
            } => {
                let tx_hash = keccak256(
                    [
                        self.chain_id.to_be_bytes().as_slice(),
                        state.nonce.to_be_bytes().as_slice(),
                        data.as_ref(),
                    ]
                    .concat(),
                );
                state.signatures.insert(tx_hash, 0);
                Ok(vec![ChainEvent {
                    name: TRANSACTION_PROPOSED.to_string(),
                    args: metadata([
                        ("txHash", MetaValue::from(tx_hash.to_string())),
                        ("proposer", MetaValue::from(self.sender.to_string())),
                        ("target", MetaValue::from(target.to_string())),
                        ("value", MetaValue::from(value.to_string())),
                    ]),
                }])
            }
            ContractCall::SignTransaction { tx_hash } => {
                if !state.signatures.contains_key(tx_hash) {
                    return Err(ChainError::Reverted("transaction does not exist".into()));
                }
                if state.executed.contains(tx_hash) {
                    return Err(ChainError::Reverted("already executed".into()));
                }
                if !state.signed_by_us.insert(*tx_hash) {
                    return Err(ChainError::Reverted("already signed".into()));
                }
                *state.signatures.entry(*tx_hash).or_insert(0) += 1;
                Ok(Vec::new())
            }
            ContractCall::ExecuteTransaction { tx_hash } => {
                let count = state.signatures.get(tx_hash).copied().ok_or_else(|| {
                    ChainError::Reverted("transaction does not exist".into())
                })?;
                if state.executed.contains(tx_hash) {
                    return Err(ChainError::Reverted("already executed".into()));
                }
                if count < state.threshold {
                    return Err(ChainError::Reverted("insufficient signatures".into()));
                }
                state.executed.insert(*tx_hash);
                Ok(Vec::new())
            }
            ContractCall::MirrorTransaction {
                source_chain_id,
                source_address,
                tx_hash,
                data,
            } => {
                if !state.supported_chains.contains(source_chain_id) {
                    return Err(ChainError::Reverted("chain not supported".into()));
                }
                if !state.mirrored.insert(*tx_hash) {
                    return Err(ChainError::Reverted("already mirrored".into()));
                }
                Ok(vec![ChainEvent {
                    name: TRANSACTION_MIRRORED.to_string(),
                    args: metadata([
                        ("sourceChainId", MetaValue::from(source_chain_id.to_string())),
                        ("sourceAddress", MetaValue::from(source_address.to_string())),
                        ("txHash", MetaValue::from(tx_hash.to_string())),
                        ("dataLength", MetaValue::from(data.len())),
                    ]),
                }])
            }
            read => Err(ChainError::Reverted(format!(
                "{} is a view function",
                read.method()
            ))),
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn call(&self, call: &ContractCall) -> Result<Bytes, ChainError> {
        let mut state = self.state();
        state.calls.push(call.clone());
        if state.offline {
            return Err(ChainError::Transport("connection refused".into()));
        }
        if let Some(error) = state.call_failures.pop_front() {
            return Err(error);
        }

        match call {
            ContractCall::GetSignatureCount { tx_hash } => Ok(encode_u64(
                state.signatures.get(tx_hash).copied().unwrap_or(0),
            )),
            ContractCall::GetThreshold => Ok(encode_u64(state.threshold)),
            ContractCall::HasRole { account, role } => {
                Ok(encode_bool(state.roles.contains(&(*account, *role))))
            }
            ContractCall::IsChainSupported { chain_id } => {
                Ok(encode_bool(state.supported_chains.contains(chain_id)))
            }
            ContractCall::IsFeatureEnabled { name } => {
                Ok(encode_bool(state.features.contains(name)))
            }
            other => Err(ChainError::Reverted(format!(
                "{} is not a view function",
                other.method()
            ))),
        }
    }

    async fn send(&self, call: &ContractCall) -> Result<TxHandle, ChainError> {
        let mut state = self.state();
        state.sent.push(call.clone());
        if state.offline {
            return Err(ChainError::Transport("connection refused".into()));
        }
        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }

        let events = self.apply(&mut state, call)?;

        state.nonce += 1;
        state.block_number += 1;
        let tx_hash = keccak256(
            [
                b"tx".as_slice(),
                self.chain_id.to_be_bytes().as_slice(),
                state.nonce.to_be_bytes().as_slice(),
            ]
            .concat(),
        );
        let receipt = Receipt {
            success: true,
            block_number: state.block_number,
            events,
        };
        state.receipts.insert(tx_hash, receipt);

        if state.lost_send_responses > 0 {
            state.lost_send_responses -= 1;
            return Err(ChainError::Transport("response lost after submission".into()));
        }

        Ok(TxHandle {
            chain_id: self.chain_id,
            tx_hash,
        })
    }

    async fn await_confirmation(&self, handle: &TxHandle) -> Result<Receipt, ChainError> {
        let delay = self.state().confirmation_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.offline {
            return Err(ChainError::Transport("connection refused".into()));
        }
        if let Some(error) = state.confirmation_failures.pop_front() {
            return Err(error);
        }

        let mut receipt = state
            .receipts
            .get(&handle.tx_hash)
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("no receipt for {}", handle.tx_hash)))?;

        if state.revert_next_receipt {
            state.revert_next_receipt = false;
            receipt.success = false;
            receipt.events.clear();
        }
        Ok(receipt)
    }

    async fn get_block_number(&self) -> Result<u64, ChainError> {
        let delay = self.state().block_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.offline {
            return Err(ChainError::Transport("connection refused".into()));
        }
        if let Some(error) = state.block_failures.pop_front() {
            return Err(error);
        }
        Ok(state.block_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{decode_bool, decode_u64};

    async fn propose(client: &MockChainClient) -> B256 {
        let handle = client
            .send(&ContractCall::ProposeTransaction {
                target: Address::ZERO,
                value: Default::default(),
                data: Bytes::from_static(b"payload"),
            })
            .await
            .unwrap();
        let receipt = client.await_confirmation(&handle).await.unwrap();
        receipt
            .event(TRANSACTION_PROPOSED)
            .and_then(|e| e.arg_str("txHash"))
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sign_twice_reverts() {
        let client = MockChainClient::new(1);
        let tx_hash = propose(&client).await;

        client
            .send(&ContractCall::SignTransaction { tx_hash })
            .await
            .unwrap();
        let err = client
            .send(&ContractCall::SignTransaction { tx_hash })
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::Reverted("already signed".into()));

        let count = client
            .call(&ContractCall::GetSignatureCount { tx_hash })
            .await
            .unwrap();
        assert_eq!(decode_u64(&count).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lost_response_still_applies() {
        let client = MockChainClient::new(1);
        let tx_hash = propose(&client).await;

        client.lose_next_send_responses(1);
        let err = client
            .send(&ContractCall::SignTransaction { tx_hash })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.signature_count(tx_hash), 1);
    }

    #[tokio::test]
    async fn test_feature_flags() {
        let client = MockChainClient::new(2);
        let query = ContractCall::IsFeatureEnabled {
            name: "mirroring".into(),
        };
        assert!(!decode_bool(&client.call(&query).await.unwrap()).unwrap());
        client.enable_feature("mirroring");
        assert!(decode_bool(&client.call(&query).await.unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let client = MockChainClient::new(1);
        client.set_offline(true);
        assert!(client.get_block_number().await.is_err());
        assert!(client.call(&ContractCall::GetThreshold).await.is_err());
        assert_eq!(client.call_count("getThreshold"), 1);
    }
}
