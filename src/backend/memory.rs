//! In-memory backend with a scriptable best chain.
//!
//! Blocks are never forgotten: rewinding only shortens the best chain, so
//! stale blocks can still be fetched by hash, as a real node would allow.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bitcoin::hashes::Hash as _;
use bitcoin::{block, merkle_tree, CompactTarget, TxMerkleNode};
use parking_lot::Mutex;

use crate::backend::{ChainBackend, RelayOutcome};
use crate::core::{BlockHeader, HeaderInfo, Transaction};
use crate::crypto::hash::Hash256;
use crate::{Result, TopologyError};

const GENESIS_TIME: u32 = 1_600_000_000;
const BLOCK_SPACING: u32 = 600;

struct StoredBlock {
    info: HeaderInfo,
    txs: Vec<Transaction>,
}

struct MemoryChain {
    blocks: HashMap<Hash256, StoredBlock>,
    best: Vec<Hash256>,
    fee_estimate: Option<u64>,
    relay_outcome: RelayOutcome,
    relayed: Vec<Vec<u8>>,
    failures_left: usize,
    nonce: u32,
}

pub struct MemoryBackend {
    chain: Mutex<MemoryChain>,
}

impl MemoryBackend {
    /// A backend holding only a genesis block at height 0.
    pub fn new() -> Self {
        let backend = Self {
            chain: Mutex::new(MemoryChain {
                blocks: HashMap::new(),
                best: Vec::new(),
                fee_estimate: Some(1000),
                relay_outcome: RelayOutcome::Accepted,
                relayed: Vec::new(),
                failures_left: 0,
                nonce: 0,
            }),
        };
        backend.mine_with_time(Vec::new(), GENESIS_TIME);
        backend
    }

    /// Extend the best chain by one block, spaced ten minutes after the tip.
    pub fn mine(&self, txs: Vec<Transaction>) -> Hash256 {
        let timestamp = {
            let chain = self.chain.lock();
            match chain.best.last() {
                Some(tip) => chain.blocks[tip].info.timestamp() + BLOCK_SPACING,
                None => GENESIS_TIME,
            }
        };
        self.mine_with_time(txs, timestamp)
    }

    pub fn mine_empty(&self, count: usize) -> Vec<Hash256> {
        (0..count).map(|_| self.mine(Vec::new())).collect()
    }

    pub fn mine_with_time(&self, txs: Vec<Transaction>, timestamp: u32) -> Hash256 {
        let mut chain = self.chain.lock();
        chain.nonce += 1;

        let (previous_hash, height) = match chain.best.last() {
            Some(tip) => (*tip, chain.blocks[tip].info.height + 1),
            None => (Hash256::zero(), 0),
        };

        let merkle_root = merkle_tree::calculate_root(txs.iter().map(|tx| tx.txid()))
            .map(|root| TxMerkleNode::from_raw_hash(root.to_raw_hash()))
            .unwrap_or_else(TxMerkleNode::all_zeros);
        let header = BlockHeader {
            version: block::Version::from_consensus(0x2000_0000),
            prev_blockhash: previous_hash.to_block_hash(),
            merkle_root,
            time: timestamp,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: chain.nonce,
        };
        let info = HeaderInfo::new(height, header);
        let hash = info.hash;

        chain.blocks.insert(hash, StoredBlock { info, txs });
        chain.best.push(hash);
        hash
    }

    /// Drop the last `depth` blocks from the best chain; genesis always stays.
    pub fn rewind(&self, depth: usize) {
        let mut chain = self.chain.lock();
        let keep = chain.best.len().saturating_sub(depth).max(1);
        chain.best.truncate(keep);
    }

    pub fn tip_height(&self) -> u32 {
        let chain = self.chain.lock();
        (chain.best.len() - 1) as u32
    }

    pub fn set_fee_estimate(&self, fee: Option<u64>) {
        self.chain.lock().fee_estimate = fee;
    }

    pub fn set_relay_outcome(&self, outcome: RelayOutcome) {
        self.chain.lock().relay_outcome = outcome;
    }

    /// Make the next `count` requests fail as if the node were unreachable.
    pub fn fail_next_requests(&self, count: usize) {
        self.chain.lock().failures_left = count;
    }

    /// Every raw transaction offered for relay, in order.
    pub fn relayed(&self) -> Vec<Vec<u8>> {
        self.chain.lock().relayed.clone()
    }

    fn with_chain<T>(&self, f: impl FnOnce(&mut MemoryChain) -> Result<T>) -> Result<T> {
        let mut chain = self.chain.lock();
        if chain.failures_left > 0 {
            chain.failures_left -= 1;
            return Err(TopologyError::Backend("connection refused".to_string()));
        }
        f(&mut chain)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_block(hash: &Hash256) -> TopologyError {
    TopologyError::Backend(format!("block not found: {}", hash))
}

#[async_trait]
impl ChainBackend for MemoryBackend {
    async fn best_block_hash(&self) -> Result<Hash256> {
        self.with_chain(|chain| {
            chain
                .best
                .last()
                .copied()
                .ok_or_else(|| TopologyError::Backend("empty chain".to_string()))
        })
    }

    async fn block_hash(&self, height: u32) -> Result<Hash256> {
        self.with_chain(|chain| {
            chain
                .best
                .get(height as usize)
                .copied()
                .ok_or_else(|| TopologyError::Backend(format!("block height {} out of range", height)))
        })
    }

    async fn block_header(&self, hash: &Hash256) -> Result<HeaderInfo> {
        self.with_chain(|chain| {
            chain
                .blocks
                .get(hash)
                .map(|block| block.info.clone())
                .ok_or_else(|| unknown_block(hash))
        })
    }

    async fn block_contents(&self, hash: &Hash256) -> Result<Vec<Transaction>> {
        self.with_chain(|chain| {
            chain
                .blocks
                .get(hash)
                .map(|block| block.txs.clone())
                .ok_or_else(|| unknown_block(hash))
        })
    }

    async fn fee_estimate(&self) -> Result<u64> {
        self.with_chain(|chain| {
            chain
                .fee_estimate
                .ok_or_else(|| TopologyError::Backend("insufficient data for fee estimate".to_string()))
        })
    }

    async fn relay(&self, raw_tx: &[u8]) -> Result<RelayOutcome> {
        self.with_chain(|chain| {
            chain.relayed.push(raw_tx.to_vec());
            Ok(chain.relay_outcome.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mine_links_blocks() {
        let backend = MemoryBackend::new();
        let genesis = backend.best_block_hash().await.unwrap();
        let next = backend.mine(Vec::new());

        let info = backend.block_header(&next).await.unwrap();
        assert_eq!(info.height, 1);
        assert_eq!(info.prev_hash(), genesis);
        assert_eq!(backend.block_hash(1).await.unwrap(), next);
    }

    #[tokio::test]
    async fn test_rewind_keeps_stale_blocks_fetchable() {
        let backend = MemoryBackend::new();
        let stale = backend.mine_empty(2)[1];
        backend.rewind(1);
        let replacement = backend.mine(Vec::new());

        assert_ne!(stale, replacement);
        assert_eq!(backend.tip_height(), 2);
        assert_eq!(backend.block_header(&stale).await.unwrap().height, 2);
    }

    #[tokio::test]
    async fn test_merkle_root_commits_to_txs() {
        use crate::core::transaction::{sample_outpoint, sample_spend};
        use bitcoin::hashes::Hash;

        let backend = MemoryBackend::new();
        let tx = sample_spend(sample_outpoint(4, 0), 1_000);
        let hash = backend.mine(vec![tx.clone()]);

        let info = backend.block_header(&hash).await.unwrap();
        assert_eq!(info.header.merkle_root.to_raw_hash(), tx.txid().to_raw_hash());
        assert_eq!(backend.block_contents(&hash).await.unwrap(), vec![tx]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next_requests(1);

        assert!(backend.best_block_hash().await.is_err());
        assert!(backend.best_block_hash().await.is_ok());
    }
}
