//! chainwatch - chain topology and transaction watching for a payment-channel daemon
//!
//! This library keeps a local view of the best chain as reported by a full
//! node and drives everything that depends on it:
//! - Hash-indexed block records with prev/next links and median time
//! - Reorg handling with a protected root block
//! - Persistent txid watches and one-shot outpoint watches
//! - Outgoing transaction relay with retry until confirmation
//! - bitcoind RPC and in-memory backends

pub mod backend;
pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod topology;

pub use error::{Result, TopologyError};
