use std::collections::HashMap;

use crate::core::{HeaderInfo, Transaction, TransactionExt};
use crate::crypto::hash::Hash256;
use crate::topology::block_index::{Block, BlockIndex};
use crate::{Result, TopologyError};

/// Number of headers in the median-time window, the block itself included.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Position of a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocator {
    pub blkheight: u32,
    pub index: u32,
}

/// The single tracked best chain, from `root` to `tip`.
#[derive(Debug, Default)]
pub struct Chain {
    index: BlockIndex,
    root: Option<Hash256>,
    tip: Option<Hash256>,
    /// txid -> hash of the block holding it
    tx_blocks: HashMap<Hash256, Hash256>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&Block> {
        self.root.and_then(|hash| self.index.get(&hash))
    }

    pub fn tip(&self) -> Option<&Block> {
        self.tip.and_then(|hash| self.index.get(&hash))
    }

    pub fn tip_hash(&self) -> Option<Hash256> {
        self.tip
    }

    pub fn height(&self) -> Option<u32> {
        self.tip().map(|block| block.height)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&Block> {
        self.index.get(hash)
    }

    pub(crate) fn get_mut(&mut self, hash: &Hash256) -> Option<&mut Block> {
        self.index.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Append a block after the tip. The first block becomes the root.
    ///
    /// `txs` are the (index-in-block, transaction) pairs worth remembering.
    pub fn connect(&mut self, info: HeaderInfo, txs: Vec<(u32, Transaction)>) -> Result<&Block> {
        let prev = match self.tip() {
            Some(tip) => {
                if info.height != tip.height + 1 {
                    return Err(TopologyError::OutOfOrder {
                        expected: tip.height + 1,
                        got: info.height,
                    });
                }
                if info.prev_hash() != tip.hash {
                    return Err(TopologyError::NotExtendingTip {
                        hash: info.hash,
                        tip: tip.hash,
                    });
                }
                Some(tip.hash)
            }
            None => None,
        };

        let mediantime = self.median_time(info.timestamp(), prev);

        let mut tx_refs = Vec::with_capacity(txs.len());
        let mut full_txs = Vec::with_capacity(txs.len());
        for (index, tx) in txs {
            let txid = tx.txid_key();
            self.tx_blocks.insert(txid, info.hash);
            tx_refs.push((txid, index));
            full_txs.push(tx);
        }

        let hash = info.hash;
        self.index.insert(Block {
            height: info.height,
            header: info.header,
            hash,
            prev,
            next: None,
            mediantime,
            txs: tx_refs,
            full_txs,
            spent_watches: Vec::new(),
            confirmed_outgoing: Vec::new(),
        });

        match prev.and_then(|prev| self.index.get_mut(&prev)) {
            Some(prev_block) => prev_block.next = Some(hash),
            None => self.root = Some(hash),
        }
        self.tip = Some(hash);

        self.index
            .get(&hash)
            .ok_or_else(|| TopologyError::TopologyCorrupt(format!("block {} vanished", hash)))
    }

    /// Remove the tip and hand it back. The root is never removed.
    pub fn disconnect_tip(&mut self) -> Result<Block> {
        let tip_hash = self
            .tip
            .ok_or_else(|| TopologyError::TopologyCorrupt("no tip to disconnect".to_string()))?;

        if self.root == Some(tip_hash) {
            return Err(TopologyError::TopologyCorrupt(format!(
                "reorg would disconnect root {}",
                tip_hash
            )));
        }

        let block = self
            .index
            .remove(&tip_hash)
            .ok_or_else(|| TopologyError::TopologyCorrupt(format!("tip {} not indexed", tip_hash)))?;

        for (txid, _) in &block.txs {
            if self.tx_blocks.get(txid) == Some(&tip_hash) {
                self.tx_blocks.remove(txid);
            }
        }

        if let Some(prev) = block.prev.and_then(|prev| self.index.get_mut(&prev)) {
            prev.next = None;
        }
        self.tip = block.prev;

        Ok(block)
    }

    pub fn block_of(&self, txid: &Hash256) -> Option<&Block> {
        self.tx_blocks.get(txid).and_then(|hash| self.index.get(hash))
    }

    pub fn locate(&self, txid: &Hash256) -> Option<TxLocator> {
        let block = self.block_of(txid)?;
        block.tx_index(txid).map(|index| TxLocator {
            blkheight: block.height,
            index,
        })
    }

    /// Median of `timestamp` and the timestamps of the 10 blocks before it,
    /// or 0 while the local chain is shorter than the window.
    fn median_time(&self, timestamp: u32, mut prev: Option<Hash256>) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        times.push(timestamp);

        while times.len() < MEDIAN_TIME_SPAN {
            match prev.and_then(|hash| self.index.get(&hash)) {
                Some(block) => {
                    times.push(block.header.time);
                    prev = block.prev;
                }
                None => return 0,
            }
        }

        times.sort_unstable();
        times[MEDIAN_TIME_SPAN / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::sample_header;
    use crate::core::transaction::{sample_outpoint, sample_spend};

    fn header_info(height: u32, prev: Hash256, timestamp: u32) -> HeaderInfo {
        HeaderInfo::new(height, sample_header(prev, timestamp, height))
    }

    fn extend(chain: &mut Chain, timestamp: u32) -> Hash256 {
        let (height, prev) = match chain.tip() {
            Some(tip) => (tip.height + 1, tip.hash),
            None => (100, Hash256::zero()),
        };
        let info = header_info(height, prev, timestamp);
        chain.connect(info, Vec::new()).unwrap().hash
    }

    fn tx(tag: u8) -> Transaction {
        sample_spend(sample_outpoint(tag, 0), 1000)
    }

    #[test]
    fn test_height_follows_connects() {
        let mut chain = Chain::new();
        assert_eq!(chain.height(), None);

        for i in 0..5 {
            extend(&mut chain, 1000 + i);
            assert_eq!(chain.height(), Some(100 + i));
        }
        assert_eq!(chain.root().unwrap().height, 100);
    }

    #[test]
    fn test_links_are_consistent() {
        let mut chain = Chain::new();
        let a = extend(&mut chain, 1);
        let b = extend(&mut chain, 2);

        let block_a = chain.get(&a).unwrap();
        let block_b = chain.get(&b).unwrap();
        assert_eq!(block_a.next, Some(b));
        assert_eq!(block_b.prev, Some(a));
        assert_eq!(block_b.height, block_a.height + 1);
    }

    #[test]
    fn test_connect_rejects_gaps_and_forks() {
        let mut chain = Chain::new();
        let a = extend(&mut chain, 1);

        let gap = header_info(102, a, 2);
        assert!(matches!(
            chain.connect(gap, Vec::new()),
            Err(TopologyError::OutOfOrder { expected: 101, got: 102 })
        ));

        let fork = header_info(101, Hash256::new([0xEE; 32]), 2);
        assert!(matches!(
            chain.connect(fork, Vec::new()),
            Err(TopologyError::NotExtendingTip { .. })
        ));
        assert_eq!(chain.height(), Some(100));
    }

    #[test]
    fn test_mediantime_needs_full_window() {
        let mut chain = Chain::new();
        // Out-of-order timestamps so the median is not simply the middle block.
        let times = [50, 10, 90, 30, 70, 20, 80, 40, 60, 0, 100, 5];

        for (i, time) in times.iter().enumerate() {
            let hash = extend(&mut chain, *time);
            let mediantime = chain.get(&hash).unwrap().mediantime;
            match i {
                0..=9 => assert_eq!(mediantime, 0),
                // window: 50 10 90 30 70 20 80 40 60 0 100
                10 => assert_eq!(mediantime, 50),
                // window: 10 90 30 70 20 80 40 60 0 100 5
                _ => assert_eq!(mediantime, 40),
            }
        }
    }

    #[test]
    fn test_locate_and_disconnect() {
        let mut chain = Chain::new();
        extend(&mut chain, 1);

        let wanted = tx(1);
        let txid = wanted.txid_key();
        let tip = chain.tip().unwrap().hash;
        let info = header_info(101, tip, 2);
        chain.connect(info, vec![(3, wanted.clone())]).unwrap();

        assert_eq!(chain.locate(&txid), Some(TxLocator { blkheight: 101, index: 3 }));
        assert_eq!(chain.block_of(&txid).unwrap().full_tx(&txid), Some(&wanted));

        let removed = chain.disconnect_tip().unwrap();
        assert_eq!(removed.height, 101);
        assert_eq!(chain.locate(&txid), None);
        assert_eq!(chain.height(), Some(100));
        assert_eq!(chain.tip().unwrap().next, None);
    }

    #[test]
    fn test_root_is_never_disconnected() {
        let mut chain = Chain::new();
        extend(&mut chain, 1);

        assert!(matches!(
            chain.disconnect_tip(),
            Err(TopologyError::TopologyCorrupt(_))
        ));
        assert_eq!(chain.len(), 1);
    }
}
