//! Registered interest in transaction ids and outpoints.
//!
//! Txid watches are persistent: they report every confirmation and every
//! unconfirmation until removed with [`WatchRegistry::unwatch`], which is what
//! depth-threshold waiting needs. Outpoint watches are one-shot: the first
//! spend removes them from the registry. The topology parks a fired outpoint
//! watch on the spending block and re-arms it if that block is disconnected.

use std::collections::HashMap;

use crate::core::OutPoint;
use crate::crypto::hash::Hash256;
use crate::topology::events::{PeerId, WatchId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxWatch {
    pub id: WatchId,
    pub txid: Hash256,
    pub peer: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxoWatch {
    pub id: WatchId,
    pub outpoint: OutPoint,
    pub peer: PeerId,
}

#[derive(Debug, Default)]
pub struct WatchRegistry {
    next_id: u64,
    txwatches: HashMap<Hash256, Vec<TxWatch>>,
    txowatches: HashMap<OutPoint, Vec<TxoWatch>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> WatchId {
        self.next_id += 1;
        WatchId(self.next_id)
    }

    pub fn watch_txid(&mut self, txid: Hash256, peer: PeerId) -> WatchId {
        let id = self.allocate_id();
        self.txwatches
            .entry(txid)
            .or_default()
            .push(TxWatch { id, txid, peer });
        log::debug!("{} on txid {} for {}", id, txid, peer);
        id
    }

    pub fn watch_txo(&mut self, outpoint: OutPoint, peer: PeerId) -> WatchId {
        let id = self.allocate_id();
        self.rearm_txo(TxoWatch { id, outpoint, peer });
        log::debug!("{} on outpoint {} for {}", id, outpoint, peer);
        id
    }

    /// Remove an armed watch of either kind. Returns whether it was found.
    pub fn unwatch(&mut self, id: WatchId) -> bool {
        let removed = remove_where(&mut self.txwatches, |w| w.id == id)
            || remove_where(&mut self.txowatches, |w| w.id == id);
        if removed {
            log::debug!("{} removed", id);
        }
        removed
    }

    pub fn txid_watches(&self, txid: &Hash256) -> &[TxWatch] {
        self.txwatches.get(txid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_watching_txid(&self, txid: &Hash256) -> bool {
        self.txwatches.contains_key(txid)
    }

    pub fn is_watching_txo(&self, outpoint: &OutPoint) -> bool {
        self.txowatches.contains_key(outpoint)
    }

    /// Fire the outpoint's watches: they leave the registry.
    pub fn take_txo_watches(&mut self, outpoint: &OutPoint) -> Vec<TxoWatch> {
        self.txowatches.remove(outpoint).unwrap_or_default()
    }

    pub fn rearm_txo(&mut self, watch: TxoWatch) {
        self.txowatches.entry(watch.outpoint).or_default().push(watch);
    }

    pub fn txid_watch_count(&self) -> usize {
        self.txwatches.values().map(Vec::len).sum()
    }

    pub fn txo_watch_count(&self) -> usize {
        self.txowatches.values().map(Vec::len).sum()
    }
}

fn remove_where<K, W>(table: &mut HashMap<K, Vec<W>>, pred: impl Fn(&W) -> bool) -> bool
where
    K: std::hash::Hash + Eq + Clone,
{
    let found = table
        .iter()
        .find(|(_, watches)| watches.iter().any(&pred))
        .map(|(key, _)| key.clone());

    let Some(key) = found else {
        return false;
    };

    if let Some(watches) = table.get_mut(&key) {
        watches.retain(|w| !pred(w));
        if watches.is_empty() {
            table.remove(&key);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(tag: u8) -> OutPoint {
        crate::core::transaction::sample_outpoint(tag, tag as u32)
    }

    #[test]
    fn test_ids_are_unique_across_kinds() {
        let mut registry = WatchRegistry::new();
        let a = registry.watch_txid(Hash256::new([1; 32]), PeerId(1));
        let b = registry.watch_txo(outpoint(2), PeerId(1));
        let c = registry.watch_txid(Hash256::new([1; 32]), PeerId(2));

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(registry.txid_watches(&Hash256::new([1; 32])).len(), 2);
    }

    #[test]
    fn test_txo_watch_is_one_shot() {
        let mut registry = WatchRegistry::new();
        registry.watch_txo(outpoint(3), PeerId(9));

        let fired = registry.take_txo_watches(&outpoint(3));
        assert_eq!(fired.len(), 1);
        assert!(!registry.is_watching_txo(&outpoint(3)));
        assert!(registry.take_txo_watches(&outpoint(3)).is_empty());

        registry.rearm_txo(fired.into_iter().next().unwrap());
        assert!(registry.is_watching_txo(&outpoint(3)));
    }

    #[test]
    fn test_unwatch_removes_only_target() {
        let mut registry = WatchRegistry::new();
        let txid = Hash256::new([4; 32]);
        let keep = registry.watch_txid(txid, PeerId(1));
        let drop = registry.watch_txid(txid, PeerId(2));
        let txo = registry.watch_txo(outpoint(5), PeerId(1));

        assert!(registry.unwatch(drop));
        assert!(!registry.unwatch(drop));
        assert_eq!(registry.txid_watches(&txid)[0].id, keep);

        assert!(registry.unwatch(txo));
        assert_eq!(registry.txo_watch_count(), 0);

        assert!(registry.unwatch(keep));
        assert!(!registry.is_watching_txid(&txid));
    }
}
