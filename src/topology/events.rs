use crate::core::OutPoint;
use crate::crypto::hash::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to the peer that owns a watch or an outgoing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Notifications produced while the chain moves.
///
/// Events are queued in the order the chain changes happened; a reorg yields
/// all of its disconnect events before any connect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    BlockConnected {
        height: u32,
        hash: Hash256,
    },
    BlockDisconnected {
        height: u32,
        hash: Hash256,
    },
    TxConfirmed {
        watch: WatchId,
        peer: PeerId,
        txid: Hash256,
        height: u32,
        index: u32,
        mediantime: u32,
    },
    /// The block that confirmed a watched txid left the chain.
    TxUnconfirmed {
        watch: WatchId,
        peer: PeerId,
        txid: Hash256,
    },
    TxoSpent {
        watch: WatchId,
        peer: PeerId,
        outpoint: OutPoint,
        spender: Hash256,
        height: u32,
        mediantime: u32,
    },
    /// The spend left the chain; the watch is armed again.
    TxoUnspent {
        watch: WatchId,
        peer: PeerId,
        outpoint: OutPoint,
    },
    RelayFailed {
        peer: PeerId,
        txid: Hash256,
        status: i32,
        message: String,
    },
    TopologyCorrupt {
        reason: String,
    },
}

impl TopologyEvent {
    /// Peer the event is addressed to, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            TopologyEvent::TxConfirmed { peer, .. }
            | TopologyEvent::TxUnconfirmed { peer, .. }
            | TopologyEvent::TxoSpent { peer, .. }
            | TopologyEvent::TxoUnspent { peer, .. }
            | TopologyEvent::RelayFailed { peer, .. } => Some(*peer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_only_for_addressed_events() {
        let addressed = TopologyEvent::TxUnconfirmed {
            watch: WatchId(1),
            peer: PeerId(4),
            txid: Hash256::new([1; 32]),
        };
        assert_eq!(addressed.peer(), Some(PeerId(4)));

        let chain_wide = TopologyEvent::BlockConnected {
            height: 1,
            hash: Hash256::new([2; 32]),
        };
        assert_eq!(chain_wide.peer(), None);
    }
}
