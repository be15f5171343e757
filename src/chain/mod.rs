//! Contract-call boundary
//!
//! The coordination layer never talks to a node directly. Everything goes
//! through [`ChainClient`], which any chain backend can implement: the
//! JSON-RPC adapter in [`evm`] or the scripted client in
//! [`crate::testing`].

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::error::ChainError;
use crate::types::{ChainId, Metadata};

pub mod evm;

/// Event emitted by the governance contract when a proposal is created
pub const TRANSACTION_PROPOSED: &str = "TransactionProposed";
/// Event emitted by the bridge contract when a transaction is mirrored
pub const TRANSACTION_MIRRORED: &str = "TransactionMirrored";

/// Contract entry points consumed by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    // Governance (multisig)
    ProposeTransaction {
        target: Address,
        value: U256,
        data: Bytes,
    },
    SignTransaction {
        tx_hash: B256,
    },
    ExecuteTransaction {
        tx_hash: B256,
    },
    GetSignatureCount {
        tx_hash: B256,
    },
    GetThreshold,
    HasRole {
        account: Address,
        role: B256,
    },

    // Bridge
    MirrorTransaction {
        source_chain_id: ChainId,
        source_address: Address,
        tx_hash: B256,
        data: Bytes,
    },
    IsChainSupported {
        chain_id: ChainId,
    },
    IsFeatureEnabled {
        name: String,
    },
}

/// Which deployed contract a call is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractTarget {
    Governance,
    Bridge,
}

impl ContractCall {
    /// Contract method name, used in logs and error context
    pub fn method(&self) -> &'static str {
        match self {
            ContractCall::ProposeTransaction { .. } => "proposeTransaction",
            ContractCall::SignTransaction { .. } => "signTransaction",
            ContractCall::ExecuteTransaction { .. } => "executeTransaction",
            ContractCall::GetSignatureCount { .. } => "getSignatureCount",
            ContractCall::GetThreshold => "getThreshold",
            ContractCall::HasRole { .. } => "hasRole",
            ContractCall::MirrorTransaction { .. } => "mirrorTransaction",
            ContractCall::IsChainSupported { .. } => "isChainSupported",
            ContractCall::IsFeatureEnabled { .. } => "isFeatureEnabled",
        }
    }

    pub fn target(&self) -> ContractTarget {
        match self {
            ContractCall::MirrorTransaction { .. }
            | ContractCall::IsChainSupported { .. }
            | ContractCall::IsFeatureEnabled { .. } => ContractTarget::Bridge,
            _ => ContractTarget::Governance,
        }
    }
}

impl fmt::Display for ContractCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Handle to a submitted state-changing transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TxHandle {
    pub chain_id: ChainId,
    pub tx_hash: B256,
}

/// Decoded contract event
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEvent {
    pub name: String,
    pub args: Metadata,
}

impl ChainEvent {
    /// String argument by name
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Receipt of a confirmed transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub success: bool,
    pub block_number: u64,
    pub events: Vec<ChainEvent>,
}

impl Receipt {
    /// First event with the given name
    pub fn event(&self, name: &str) -> Option<&ChainEvent> {
        self.events.iter().find(|e| e.name == name)
    }
}

/// Client for one chain's governance and bridge contracts
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Read-only query, returns ABI-encoded return data
    async fn call(&self, call: &ContractCall) -> Result<Bytes, ChainError>;

    /// State-changing call, returns a handle for confirmation tracking
    async fn send(&self, call: &ContractCall) -> Result<TxHandle, ChainError>;

    /// Wait until the transaction is final enough to act on
    async fn await_confirmation(&self, handle: &TxHandle) -> Result<Receipt, ChainError>;

    /// Current block height, used as the liveness check
    async fn get_block_number(&self) -> Result<u64, ChainError>;
}

// ============================================================================
// ABI word helpers
// ============================================================================

fn first_word(data: &[u8]) -> Result<U256, ChainError> {
    if data.len() < 32 {
        return Err(ChainError::Decode(format!(
            "expected at least 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(U256::from_be_slice(&data[..32]))
}

/// Decode a `uint256` return value that must fit in a u64
pub fn decode_u64(data: &[u8]) -> Result<u64, ChainError> {
    let word = first_word(data)?;
    u64::try_from(word).map_err(|_| ChainError::Decode(format!("value {} overflows u64", word)))
}

/// Decode a `bool` return value
pub fn decode_bool(data: &[u8]) -> Result<bool, ChainError> {
    let word = first_word(data)?;
    if word == U256::ZERO {
        Ok(false)
    } else if word == U256::from(1u8) {
        Ok(true)
    } else {
        Err(ChainError::Decode(format!("invalid bool word {}", word)))
    }
}

/// Encode a u64 as a single ABI word
pub fn encode_u64(value: u64) -> Bytes {
    Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec())
}

/// Encode a bool as a single ABI word
pub fn encode_bool(value: bool) -> Bytes {
    encode_u64(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_roundtrip() {
        assert_eq!(decode_u64(&encode_u64(42)).unwrap(), 42);
        assert!(decode_bool(&encode_bool(true)).unwrap());
        assert!(!decode_bool(&encode_bool(false)).unwrap());
    }

    #[test]
    fn test_short_data_rejected() {
        assert!(matches!(decode_u64(&[0u8; 31]), Err(ChainError::Decode(_))));
        assert!(matches!(decode_bool(&[]), Err(ChainError::Decode(_))));
    }

    #[test]
    fn test_invalid_bool_word() {
        assert!(decode_bool(&encode_u64(2)).is_err());
    }

    #[test]
    fn test_u64_overflow() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(decode_u64(&word).is_err());
    }

    #[test]
    fn test_call_targets() {
        assert_eq!(ContractCall::GetThreshold.target(), ContractTarget::Governance);
        assert_eq!(
            ContractCall::IsChainSupported { chain_id: 1 }.target(),
            ContractTarget::Bridge
        );
        assert_eq!(
            ContractCall::SignTransaction { tx_hash: B256::ZERO }.method(),
            "signTransaction"
        );
    }
}
