//! CL8Y Bridge Coordinator - Library interface
//!
//! Off-chain coordination for cross-chain governance and mirrored
//! transactions. Re-exports every module for use in integration tests.

pub mod alerts;
pub mod anomaly;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod server;
pub mod testing;
pub mod tracker;
pub mod types;

pub use error::{BridgeError, ChainError};
