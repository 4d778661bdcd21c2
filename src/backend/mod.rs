//! Full-node backends feeding the topology.
//!
//! The topology never validates what it is told: the backend is the source of
//! chain truth. Every call may fail transiently, in which case the topology
//! leaves its state untouched and asks again on the next tick.

pub mod bitcoind;
pub mod memory;

use async_trait::async_trait;

use crate::core::{HeaderInfo, Transaction};
use crate::crypto::hash::Hash256;
use crate::Result;

pub use bitcoind::BitcoindBackend;
pub use memory::MemoryBackend;

/// Result of offering a raw transaction to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Accepted,
    Rejected { status: i32, message: String },
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Hash of the backend's current best block.
    async fn best_block_hash(&self) -> Result<Hash256>;

    /// Hash of the best-chain block at `height`.
    async fn block_hash(&self, height: u32) -> Result<Hash256>;

    async fn block_header(&self, hash: &Hash256) -> Result<HeaderInfo>;

    /// All transactions of a block, in block order.
    async fn block_contents(&self, hash: &Hash256) -> Result<Vec<Transaction>>;

    /// Fee estimate in satoshi per kilo-vbyte.
    async fn fee_estimate(&self) -> Result<u64>;

    async fn relay(&self, raw_tx: &[u8]) -> Result<RelayOutcome>;
}
