//! Retry with exponential backoff for chain calls
//!
//! Every external call made by the coordinator and the health monitor goes
//! through [`RetryExecutor::execute`]. Transport-class failures are retried
//! with capped exponential backoff; a revert is surfaced immediately as
//! [`BridgeError::ContractRejection`] because repeating a rejected
//! state-changing call only produces duplicate-state errors.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BridgeError, ChainError};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_factor,
        }
    }

    /// One attempt, no waiting. Used for liveness checks.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(retry as i32);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Wraps an operation with the retry policy
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Each retry re-invokes the operation, so anything wrapped here must be
    /// safe to repeat.
    pub async fn execute<T, F, Fut>(
        &self,
        context: &str,
        mut operation: F,
    ) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(context, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(ChainError::Reverted(reason)) => {
                    warn!(
                        context,
                        attempt,
                        reason = %reason,
                        "Contract rejected call, not retrying"
                    );
                    return Err(BridgeError::ContractRejection {
                        context: context.to_string(),
                        attempt,
                        reason,
                    });
                }
                Err(e) if !e.is_retryable() => {
                    warn!(context, attempt, error = %e, "Permanent chain error, not retrying");
                    return Err(BridgeError::Chain {
                        context: context.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        warn!(
                            context,
                            attempts = attempt,
                            error = %e,
                            "Retry attempts exhausted"
                        );
                        return Err(BridgeError::OperationExhausted {
                            context: context.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let delay = self.policy.delay_for_retry(attempt - 1);
                    warn!(
                        context,
                        attempt,
                        max = max_attempts,
                        ?delay,
                        error = %e,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
