use std::collections::HashMap;

use crate::core::{BlockHeader, Transaction};
use crate::crypto::hash::Hash256;
use crate::topology::broadcast::OutgoingTx;
use crate::topology::watch::TxoWatch;

/// A block on the tracked chain.
///
/// Links are hash keys into the [`BlockIndex`], never references, so removing
/// a block cannot leave another one pointing at freed memory.
#[derive(Debug, Clone)]
pub struct Block {
    pub height: u32,
    pub header: BlockHeader,
    pub hash: Hash256,
    pub prev: Option<Hash256>,
    pub next: Option<Hash256>,
    /// 0 if not enough predecessors.
    pub mediantime: u32,
    /// Transactions in this block we care about, with their index in the block.
    pub txs: Vec<(Hash256, u32)>,
    /// Bodies of `txs`, same order.
    pub full_txs: Vec<Transaction>,
    /// One-shot outpoint watches fired by this block.
    pub(crate) spent_watches: Vec<TxoWatch>,
    /// Outgoing transactions confirmed by this block.
    pub(crate) confirmed_outgoing: Vec<OutgoingTx>,
}

impl Block {
    pub fn tx_index(&self, txid: &Hash256) -> Option<u32> {
        self.txs.iter().find(|(id, _)| id == txid).map(|(_, index)| *index)
    }

    pub fn full_tx(&self, txid: &Hash256) -> Option<&Transaction> {
        self.txs
            .iter()
            .position(|(id, _)| id == txid)
            .and_then(|pos| self.full_txs.get(pos))
    }
}

/// Blocks keyed by hash.
#[derive(Debug, Default)]
pub struct BlockIndex {
    blocks: HashMap<Hash256, Block>,
}

impl BlockIndex {
    pub fn insert(&mut self, block: Block) -> Option<Block> {
        self.blocks.insert(block.hash, block)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut Block> {
        self.blocks.get_mut(hash)
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        self.blocks.remove(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
