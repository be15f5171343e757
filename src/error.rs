//! Error types for the coordination layer

use std::time::Duration;
use thiserror::Error;

use crate::types::{ChainId, OperationStatus};

/// Failure reported by a chain client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    /// Connection or HTTP level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object returned by the node
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The chain accepted the call but execution reverted
    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The client has no contract configured for this call
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl ChainError {
    /// Transport-class failures are retried; rejections and local faults are not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_) | ChainError::Rpc { .. } | ChainError::Timeout(_)
        )
    }
}

/// Errors surfaced by the coordination layer
#[derive(Error, Debug)]
pub enum BridgeError {
    // ========================================================================
    // External call failures
    // ========================================================================
    #[error("{context}: gave up after {attempts} attempts: {source}")]
    OperationExhausted {
        context: String,
        attempts: u32,
        source: ChainError,
    },

    #[error("{context}: contract rejected call on attempt {attempt}: {reason}")]
    ContractRejection {
        context: String,
        attempt: u32,
        reason: String,
    },

    #[error("{context}: {source}")]
    Chain { context: String, source: ChainError },

    #[error("{context}: receipt has no {event} event")]
    MissingEvent {
        context: String,
        event: &'static str,
    },

    // ========================================================================
    // Tracker invariant violations
    // ========================================================================
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("operation {0} is already tracked and pending")]
    DuplicateId(String),

    #[error("operation {id} is already {status}")]
    AlreadyTerminal { id: String, status: OperationStatus },

    // ========================================================================
    // Preconditions checked before any external call
    // ========================================================================
    #[error("unknown chain: {0}")]
    UnknownChain(ChainId),

    #[error("source chain {0} is not supported by the bridge")]
    UnsupportedChain(ChainId),

    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("insufficient signatures for {operation_id}: {signatures}/{threshold}")]
    InsufficientSignatures {
        operation_id: String,
        signatures: u64,
        threshold: u64,
    },
}

impl BridgeError {
    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::OperationExhausted { .. } => "operation_exhausted",
            BridgeError::ContractRejection { .. } => "contract_rejection",
            BridgeError::Chain { .. } => "chain_error",
            BridgeError::MissingEvent { .. } => "missing_event",
            BridgeError::UnknownOperation(_) => "unknown_operation",
            BridgeError::DuplicateId(_) => "duplicate_id",
            BridgeError::AlreadyTerminal { .. } => "already_terminal",
            BridgeError::UnknownChain(_) => "unknown_chain",
            BridgeError::UnsupportedChain(_) => "unsupported_chain",
            BridgeError::FeatureDisabled(_) => "feature_disabled",
            BridgeError::InsufficientSignatures { .. } => "insufficient_signatures",
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ChainError::Transport("connection reset".into()).is_retryable());
        assert!(ChainError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ChainError::Rpc {
            code: -32000,
            message: "header not found".into()
        }
        .is_retryable());
        assert!(!ChainError::Reverted("already signed".into()).is_retryable());
        assert!(!ChainError::Decode("short word".into()).is_retryable());
        assert!(!ChainError::NotConfigured("bridge".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_message_carries_context() {
        let err = BridgeError::OperationExhausted {
            context: "sign governance action".into(),
            attempts: 3,
            source: ChainError::Transport("connection refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("sign governance action"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection refused"));
        assert_eq!(err.kind(), "operation_exhausted");
    }
}
