//! Coordinator configuration
//!
//! # Environment Variable Schema
//!
//! ```text
//! CHAINS_COUNT=2                        # Number of chains to configure
//! CHAIN_1_NAME=ethereum                 # optional, default chain_1
//! CHAIN_1_ID=1                          # Native EVM chain ID
//! CHAIN_1_RPC_URL=https://...
//! CHAIN_1_PRIVATE_KEY=0x...             # optional, signs state-changing calls
//! CHAIN_1_CONFIRMATIONS=12              # optional, default 12
//! CHAIN_1_GOVERNANCE_ADDRESS=0x...      # optional
//! CHAIN_1_BRIDGE_ADDRESS=0x...          # optional
//! GOVERNANCE_CHAIN_ID=1                 # optional, default first chain
//! DESTINATION_CHAIN_ID=1                # optional, default first chain
//! ```
//!
//! Retry, health, monitoring, threshold, retention and API settings are
//! optional and fall back to the defaults below. A value that is present but
//! does not parse is an error, never silently replaced by the default.

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::anomaly::Thresholds;
use crate::chain::evm::EvmClientConfig;
use crate::monitor::MonitorConfig;
use crate::retry::RetryPolicy;
use crate::types::ChainId;

const DEFAULT_CONFIRMATIONS: u64 = 12;
const DEFAULT_API_PORT: u16 = 9095;

/// One chain's connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: ChainId,
    pub rpc_url: String,
    pub confirmations: u64,
    pub governance_address: Option<Address>,
    pub bridge_address: Option<Address>,
    /// Signing key; chains without one are read-only
    pub private_key: Option<String>,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &self.rpc_url)
            .field("confirmations", &self.confirmations)
            .field("governance_address", &self.governance_address)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ChainConfig {
    pub fn evm_client_config(&self) -> EvmClientConfig {
        let mut config = EvmClientConfig::new(self.chain_id, self.rpc_url.clone());
        config.private_key = self.private_key.clone();
        config.governance_address = self.governance_address;
        config.bridge_address = self.bridge_address;
        config.required_confirmations = self.confirmations;
        config
    }
}

/// Coordinator configuration
#[derive(Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub governance_chain_id: ChainId,
    pub destination_chain_id: ChainId,

    pub retry: RetryPolicy,

    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub monitor_interval: Duration,

    pub thresholds: Thresholds,
    pub alert_cooldown: Duration,

    pub operation_retention: Duration,
    pub alert_retention: Duration,

    /// Webhook for alert delivery; may embed a token, never logged
    pub alert_webhook_url: Option<String>,

    pub api_bind_address: String,
    pub api_port: u16,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("chains", &self.chains)
            .field("governance_chain_id", &self.governance_chain_id)
            .field("destination_chain_id", &self.destination_chain_id)
            .field("retry", &self.retry)
            .field("health_check_interval", &self.health_check_interval)
            .field("health_check_timeout", &self.health_check_timeout)
            .field("monitor_interval", &self.monitor_interval)
            .field("thresholds", &self.thresholds)
            .field("alert_cooldown", &self.alert_cooldown)
            .field("operation_retention", &self.operation_retention)
            .field("alert_retention", &self.alert_retention)
            .field(
                "alert_webhook_url",
                &self.alert_webhook_url.as_ref().map(|_| "<redacted>"),
            )
            .field("api_bind_address", &self.api_bind_address)
            .field("api_port", &self.api_port)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment
    pub fn load() -> Result<Self> {
        // Try to load .env file
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }
        Self::from_env()
    }

    /// Build from the process environment without reading `.env`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, then validate
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let count: usize = vars.required_parsed("CHAINS_COUNT")?;
        let mut chains = Vec::with_capacity(count);
        for i in 1..=count {
            chains.push(load_chain(&vars, i)?);
        }

        let first_chain = chains.first().map(|c| c.chain_id).unwrap_or_default();

        let config = Self {
            governance_chain_id: vars.parsed_or("GOVERNANCE_CHAIN_ID", first_chain)?,
            destination_chain_id: vars.parsed_or("DESTINATION_CHAIN_ID", first_chain)?,
            chains,
            retry: RetryPolicy::new(
                vars.parsed_or("RETRY_MAX_ATTEMPTS", 3)?,
                vars.millis_or("RETRY_INITIAL_DELAY_MS", 1_000)?,
                vars.millis_or("RETRY_MAX_DELAY_MS", 30_000)?,
                vars.parsed_or("RETRY_BACKOFF_FACTOR", 2.0)?,
            ),
            health_check_interval: vars.millis_or("HEALTH_CHECK_INTERVAL_MS", 30_000)?,
            health_check_timeout: vars.millis_or("HEALTH_CHECK_TIMEOUT_MS", 5_000)?,
            monitor_interval: vars.millis_or("MONITOR_INTERVAL_MS", 15_000)?,
            thresholds: Thresholds {
                failure_rate_threshold: vars.parsed_or("FAILURE_RATE_THRESHOLD", 0.1)?,
                max_failures_per_minute: vars.parsed_or("MAX_FAILURES_PER_MINUTE", 5)?,
                response_time_threshold_ms: vars.parsed_or("RESPONSE_TIME_THRESHOLD_MS", 30_000)?,
                cross_chain_latency_threshold_ms: vars
                    .parsed_or("CROSS_CHAIN_LATENCY_THRESHOLD_MS", 300_000)?,
            },
            alert_cooldown: vars.millis_or("ALERT_COOLDOWN_MS", 300_000)?,
            operation_retention: vars.millis_or("OPERATION_RETENTION_MS", 86_400_000)?,
            alert_retention: vars.millis_or("ALERT_RETENTION_MS", 86_400_000)?,
            alert_webhook_url: vars.optional("ALERT_WEBHOOK_URL"),
            api_bind_address: vars
                .optional("API_BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: vars.parsed_or("API_PORT", DEFAULT_API_PORT)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(eyre!("CHAINS_COUNT must be at least 1"));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            validate_rpc_url(&chain.rpc_url, &format!("RPC URL for chain {}", chain.name))?;
            if !seen.insert(chain.chain_id) {
                return Err(eyre!("Duplicate chain id {}", chain.chain_id));
            }
            if let Some(key) = &chain.private_key {
                validate_private_key(key, &chain.name)?;
            }
        }

        for (name, id) in [
            ("GOVERNANCE_CHAIN_ID", self.governance_chain_id),
            ("DESTINATION_CHAIN_ID", self.destination_chain_id),
        ] {
            if !seen.contains(&id) {
                return Err(eyre!("{} {} is not a configured chain", name, id));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(eyre!("RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(eyre!("RETRY_BACKOFF_FACTOR must be >= 1.0"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(eyre!("RETRY_INITIAL_DELAY_MS must not exceed RETRY_MAX_DELAY_MS"));
        }

        let rate = self.thresholds.failure_rate_threshold;
        if !(0.0..=1.0).contains(&rate) {
            return Err(eyre!("FAILURE_RATE_THRESHOLD must be within [0, 1], got {}", rate));
        }
        if self.thresholds.max_failures_per_minute == 0 {
            return Err(eyre!("MAX_FAILURES_PER_MINUTE must be at least 1"));
        }

        if self.health_check_interval.is_zero() || self.monitor_interval.is_zero() {
            return Err(eyre!("Polling intervals must be greater than zero"));
        }
        if self.health_check_timeout.is_zero() {
            return Err(eyre!("HEALTH_CHECK_TIMEOUT_MS must be greater than zero"));
        }

        if let Some(url) = &self.alert_webhook_url {
            validate_rpc_url(url, "ALERT_WEBHOOK_URL")?;
        }

        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.monitor_interval,
            operation_retention: self.operation_retention,
            alert_retention: self.alert_retention,
        }
    }
}

fn load_chain<F>(vars: &Vars<F>, i: usize) -> Result<ChainConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!("CHAIN_{}", i);

    Ok(ChainConfig {
        name: vars
            .optional(&format!("{}_NAME", prefix))
            .unwrap_or_else(|| format!("chain_{}", i)),
        chain_id: vars.required_parsed(&format!("{}_ID", prefix))?,
        rpc_url: vars.required(&format!("{}_RPC_URL", prefix))?,
        confirmations: vars.parsed_or(&format!("{}_CONFIRMATIONS", prefix), DEFAULT_CONFIRMATIONS)?,
        governance_address: vars.optional_parsed(&format!("{}_GOVERNANCE_ADDRESS", prefix))?,
        bridge_address: vars.optional_parsed(&format!("{}_BRIDGE_ADDRESS", prefix))?,
        private_key: vars.optional(&format!("{}_PRIVATE_KEY", prefix)),
    })
}

/// Validates that a URL uses http/https and has a host component
pub fn validate_rpc_url(url_str: &str, name: &str) -> Result<()> {
    let parsed =
        url::Url::parse(url_str).map_err(|e| eyre!("{} must be a valid URL: {}", name, e))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(eyre!(
            "{} must use http:// or https:// scheme, got {}",
            name,
            scheme
        ));
    }

    if parsed.host_str().is_none() {
        return Err(eyre!("{} must have a host component", name));
    }

    Ok(())
}

/// Private keys must be 0x followed by 64 hex chars; the key is never echoed
fn validate_private_key(key: &str, chain: &str) -> Result<()> {
    let valid = key.len() == 66
        && key
            .strip_prefix("0x")
            .is_some_and(|hex| hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(eyre!(
            "private key for chain {} must be 66 chars (0x + 64 hex chars)",
            chain
        ));
    }
    Ok(())
}

/// Typed access over a key lookup; blank values count as unset
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key).ok_or_else(|| eyre!("Missing {}", key))
    }

    fn required_parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.required(key)?;
        raw.parse()
            .map_err(|e: T::Err| eyre!("Invalid {} '{}': {}", key, raw, e))
    }

    fn optional_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.optional(key)
            .map(|raw| {
                raw.parse()
                    .map_err(|e: T::Err| eyre!("Invalid {} '{}': {}", key, raw, e))
            })
            .transpose()
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.optional_parsed(key)?.unwrap_or(default))
    }

    fn millis_or(&self, key: &str, default_ms: u64) -> Result<Duration> {
        self.parsed_or(key, default_ms)
            .map(Duration::from_millis)
            .wrap_err_with(|| format!("{} must be a number of milliseconds", key))
    }
}
