use std::collections::VecDeque;

use crate::crypto::hash::Hash256;
use crate::topology::events::PeerId;

/// What to do when the backend refuses a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Emit `RelayFailed` and forget the transaction.
    ReportFailure,
    /// Keep offering it every tick until it confirms.
    RetryUntilConfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingTx {
    pub peer: PeerId,
    pub raw: Vec<u8>,
    pub txid: Hash256,
    pub policy: RelayPolicy,
}

/// Locally originated transactions not yet seen in a block, in insertion order.
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    entries: VecDeque<OutgoingTx>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tx: OutgoingTx) {
        self.entries.push_back(tx);
    }

    /// Put back a transaction whose confirming block left the chain.
    pub fn requeue(&mut self, tx: OutgoingTx) {
        if !self.contains(&tx.txid) {
            self.entries.push_back(tx);
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.iter().any(|tx| &tx.txid == txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&OutgoingTx> {
        self.entries.iter().find(|tx| &tx.txid == txid)
    }

    pub fn get_mut(&mut self, txid: &Hash256) -> Option<&mut OutgoingTx> {
        self.entries.iter_mut().find(|tx| &tx.txid == txid)
    }

    /// Remove an entry, either confirmed or permanently failed.
    pub fn take(&mut self, txid: &Hash256) -> Option<OutgoingTx> {
        let pos = self.entries.iter().position(|tx| &tx.txid == txid)?;
        self.entries.remove(pos)
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.iter().map(|tx| tx.txid).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
