//! EVM chain client over alloy providers
//!
//! Reads go through `eth_call` on a read-only provider. Writes are signed
//! locally by the configured key and submitted through a provider with the
//! recommended fillers (nonce, gas, chain id). Confirmations are found by
//! polling the receipt until the required number of blocks has been built on
//! top.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use alloy::transports::{RpcError, TransportError, TransportResult};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{ChainClient, ChainEvent, ContractCall, ContractTarget, Receipt, TxHandle};
use super::{TRANSACTION_MIRRORED, TRANSACTION_PROPOSED};
use crate::error::ChainError;
use crate::types::{metadata, ChainId, MetaValue};

sol! {
    interface IGovernance {
        event TransactionProposed(
            bytes32 indexed txHash,
            address indexed proposer,
            address target,
            uint256 value,
            bytes data
        );

        function proposeTransaction(address target, uint256 value, bytes data)
            external returns (bytes32);
        function signTransaction(bytes32 txHash) external;
        function executeTransaction(bytes32 txHash) external;
        function getSignatureCount(bytes32 txHash) external view returns (uint256);
        function getThreshold() external view returns (uint256);
        function hasRole(bytes32 role, address account) external view returns (bool);
    }

    interface IBridge {
        event TransactionMirrored(
            uint256 indexed sourceChainId,
            address indexed sourceAddress,
            bytes32 indexed txHash,
            bytes data
        );

        function mirrorTransaction(
            uint256 sourceChainId,
            address sourceAddress,
            bytes32 txHash,
            bytes data
        ) external;
        function isChainSupported(uint256 chainId) external view returns (bool);
        function isFeatureEnabled(string name) external view returns (bool);
    }
}

/// Connection settings for one EVM chain
#[derive(Clone)]
pub struct EvmClientConfig {
    pub chain_id: ChainId,
    pub rpc_url: String,
    /// Signing key for state-changing calls; without it the client is read-only
    pub private_key: Option<String>,
    pub governance_address: Option<Address>,
    pub bridge_address: Option<Address>,
    pub required_confirmations: u64,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Receipt polling interval
    pub poll_interval: Duration,
    /// Give up waiting for a receipt after this long
    pub confirmation_timeout: Duration,
}

impl EvmClientConfig {
    pub fn new(chain_id: ChainId, rpc_url: impl Into<String>) -> Self {
        Self {
            chain_id,
            rpc_url: rpc_url.into(),
            private_key: None,
            governance_address: None,
            bridge_address: None,
            required_confirmations: 12,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(600),
        }
    }
}

/// Redacts the private key
impl fmt::Debug for EvmClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmClientConfig")
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("governance_address", &self.governance_address)
            .field("bridge_address", &self.bridge_address)
            .field("required_confirmations", &self.required_confirmations)
            .field("request_timeout", &self.request_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .finish()
    }
}

/// [`ChainClient`] for an EVM chain
pub struct EvmRpcClient {
    config: EvmClientConfig,
    rpc_url: Url,
    provider: RootProvider<Http<Client>>,
    signer: Option<PrivateKeySigner>,
}

/// Delegates to the redacting config Debug
impl fmt::Debug for EvmRpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmRpcClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EvmRpcClient {
    pub fn new(config: EvmClientConfig) -> Result<Self, ChainError> {
        let rpc_url: Url = config
            .rpc_url
            .parse()
            .map_err(|e| ChainError::NotConfigured(format!("invalid RPC URL: {}", e)))?;

        // The key itself never appears in the error
        let signer = config
            .private_key
            .as_deref()
            .map(|key| {
                key.parse::<PrivateKeySigner>().map_err(|_| {
                    ChainError::NotConfigured(format!(
                        "invalid private key for chain {}",
                        config.chain_id
                    ))
                })
            })
            .transpose()?;

        let provider = ProviderBuilder::new().on_http(rpc_url.clone());

        info!(
            chain_id = config.chain_id,
            rpc_url = %config.rpc_url,
            signer = ?signer.as_ref().map(|s| s.address()),
            "Created EVM client"
        );

        Ok(Self {
            config,
            rpc_url,
            provider,
            signer,
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    /// Address transactions are sent from, if a key is configured
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    fn contract_address(&self, call: &ContractCall) -> Result<Address, ChainError> {
        let (address, label) = match call.target() {
            ContractTarget::Governance => (self.config.governance_address, "governance contract"),
            ContractTarget::Bridge => (self.config.bridge_address, "bridge contract"),
        };
        address.ok_or_else(|| {
            ChainError::NotConfigured(format!(
                "{} on chain {} (needed for {})",
                label,
                self.config.chain_id,
                call.method()
            ))
        })
    }

    /// Bound one RPC round trip by the request timeout
    async fn timed<T>(
        &self,
        request: impl Future<Output = TransportResult<T>>,
    ) -> Result<T, ChainError> {
        tokio::time::timeout(self.config.request_timeout, request)
            .await
            .map_err(|_| ChainError::Timeout(self.config.request_timeout))?
            .map_err(classify_transport_error)
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn call(&self, call: &ContractCall) -> Result<Bytes, ChainError> {
        let to = self.contract_address(call)?;
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(encode_call(call));

        self.timed(async { self.provider.call(&tx).await }).await
    }

    async fn send(&self, call: &ContractCall) -> Result<TxHandle, ChainError> {
        let to = self.contract_address(call)?;
        let signer = self.signer.as_ref().ok_or_else(|| {
            ChainError::NotConfigured(format!(
                "signing key on chain {} (needed for {})",
                self.config.chain_id,
                call.method()
            ))
        })?;

        // Build provider with signer and the recommended fillers
        let wallet = EthereumWallet::from(signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.clone());

        let tx = TransactionRequest::default()
            .with_from(signer.address())
            .with_to(to)
            .with_input(encode_call(call));

        debug!(
            chain_id = self.config.chain_id,
            method = call.method(),
            to = %to,
            "Sending transaction"
        );

        let pending = self
            .timed(async { provider.send_transaction(tx).await })
            .await?;
        let tx_hash = *pending.tx_hash();
        info!(chain_id = self.config.chain_id, tx_hash = %tx_hash, "Transaction sent");

        Ok(TxHandle {
            chain_id: self.config.chain_id,
            tx_hash,
        })
    }

    async fn await_confirmation(&self, handle: &TxHandle) -> Result<Receipt, ChainError> {
        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;

        loop {
            let receipt = self
                .timed(async { self.provider.get_transaction_receipt(handle.tx_hash).await })
                .await?;

            if let Some(receipt) = receipt {
                let block_number = receipt
                    .block_number
                    .ok_or_else(|| ChainError::Decode("mined receipt has no block number".into()))?;
                let success = receipt.status();

                let current = self.get_block_number().await?;
                let confirmations = current.saturating_sub(block_number);

                if !success || confirmations >= self.config.required_confirmations {
                    let events = receipt
                        .inner
                        .logs()
                        .iter()
                        .filter_map(|log| decode_event(log).transpose())
                        .collect::<Result<Vec<_>, _>>()?;

                    return Ok(Receipt {
                        success,
                        block_number,
                        events,
                    });
                }

                debug!(
                    tx_hash = %handle.tx_hash,
                    confirmations,
                    required = self.config.required_confirmations,
                    "Waiting for confirmations"
                );
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::Timeout(self.config.confirmation_timeout));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn get_block_number(&self) -> Result<u64, ChainError> {
        self.timed(async { self.provider.get_block_number().await })
            .await
    }
}

/// ABI-encode calldata for a contract call
pub fn encode_call(call: &ContractCall) -> Vec<u8> {
    match call.clone() {
        ContractCall::ProposeTransaction {
            target,
            value,
            data,
        } => IGovernance::proposeTransactionCall {
            target,
            value,
            data,
        }
        .abi_encode(),
        ContractCall::SignTransaction { tx_hash } => {
            IGovernance::signTransactionCall { txHash: tx_hash }.abi_encode()
        }
        ContractCall::ExecuteTransaction { tx_hash } => {
            IGovernance::executeTransactionCall { txHash: tx_hash }.abi_encode()
        }
        ContractCall::GetSignatureCount { tx_hash } => {
            IGovernance::getSignatureCountCall { txHash: tx_hash }.abi_encode()
        }
        ContractCall::GetThreshold => IGovernance::getThresholdCall {}.abi_encode(),
        ContractCall::HasRole { account, role } => {
            IGovernance::hasRoleCall { role, account }.abi_encode()
        }
        ContractCall::MirrorTransaction {
            source_chain_id,
            source_address,
            tx_hash,
            data,
        } => IBridge::mirrorTransactionCall {
            sourceChainId: U256::from(source_chain_id),
            sourceAddress: source_address,
            txHash: tx_hash,
            data,
        }
        .abi_encode(),
        ContractCall::IsChainSupported { chain_id } => IBridge::isChainSupportedCall {
            chainId: U256::from(chain_id),
        }
        .abi_encode(),
        ContractCall::IsFeatureEnabled { name } => {
            IBridge::isFeatureEnabledCall { name }.abi_encode()
        }
    }
}

/// Map a JSON-RPC error object onto a [`ChainError`]
///
/// Reverts are rejections by the contract; everything else is treated as a
/// node-side failure that may succeed on retry.
pub fn classify_rpc_error(code: i64, message: String) -> ChainError {
    let lower = message.to_lowercase();
    if lower.contains("revert")
        || lower.contains("already signed")
        || lower.contains("already executed")
        || lower.contains("invalid opcode")
    {
        return ChainError::Reverted(message);
    }
    ChainError::Rpc { code, message }
}

/// Map an alloy transport failure onto a [`ChainError`]
pub fn classify_transport_error(err: TransportError) -> ChainError {
    match err {
        RpcError::ErrorResp(payload) => {
            classify_rpc_error(payload.code, payload.message.to_string())
        }
        RpcError::NullResp => ChainError::Decode("node returned a null response".into()),
        RpcError::DeserError { err, .. } => ChainError::Decode(err.to_string()),
        // Signing and filling happen locally; repeating them cannot help
        RpcError::LocalUsageError(e) => ChainError::NotConfigured(e.to_string()),
        other => ChainError::Transport(other.to_string()),
    }
}

/// Decode the events the coordinator cares about; unknown logs are skipped
fn decode_event(log: &Log) -> Result<Option<ChainEvent>, ChainError> {
    let topics = log.topics();
    let Some(signature) = topics.first() else {
        return Ok(None);
    };

    if *signature == IGovernance::TransactionProposed::SIGNATURE_HASH && topics.len() >= 3 {
        let proposer = Address::from_word(topics[2]);
        return Ok(Some(ChainEvent {
            name: TRANSACTION_PROPOSED.to_string(),
            args: metadata([
                ("txHash", MetaValue::from(topics[1].to_string())),
                ("proposer", MetaValue::from(proposer.to_string())),
            ]),
        }));
    }

    if *signature == IBridge::TransactionMirrored::SIGNATURE_HASH && topics.len() >= 4 {
        let source_chain_id = U256::from_be_bytes(topics[1].0);
        let source_address = Address::from_word(topics[2]);
        return Ok(Some(ChainEvent {
            name: TRANSACTION_MIRRORED.to_string(),
            args: metadata([
                ("sourceChainId", MetaValue::from(source_chain_id.to_string())),
                ("sourceAddress", MetaValue::from(source_address.to_string())),
                ("txHash", MetaValue::from(topics[3].to_string())),
                ("dataLength", MetaValue::from(log.data().data.len())),
            ]),
        }));
    }

    Ok(None)
}
