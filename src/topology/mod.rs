//! Chain topology: the locally tracked best chain and the watches and
//! outgoing transactions that depend on it.
//!
//! A [`Topology`] is driven by [`Topology::poll`]. Each tick first gathers
//! everything it needs from the backend without touching local state, then
//! applies the resulting disconnects and connects in one synchronous step.
//! Queries therefore always see a settled chain, and a backend failure in the
//! middle of a tick changes nothing.

pub mod block_index;
pub mod broadcast;
pub mod chain;
pub mod events;
pub mod service;
pub mod watch;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{ChainBackend, RelayOutcome};
use crate::config::TopologyConfig;
use crate::core::{HeaderInfo, OutPoint, Transaction, TransactionExt};
use crate::crypto::hash::Hash256;
use crate::{Result, TopologyError};

pub use block_index::{Block, BlockIndex};
pub use broadcast::{BroadcastQueue, OutgoingTx, RelayPolicy};
pub use chain::{Chain, TxLocator, MEDIAN_TIME_SPAN};
pub use events::{PeerId, TopologyEvent, WatchId};
pub use service::{TopologyHandle, TopologyService, TopologyStatus};
pub use watch::{TxWatch, TxoWatch, WatchRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologyState {
    /// Allocated, no backend yet.
    Init,
    /// Replaying blocks from the rewind floor up to the backend's tip.
    Syncing,
    /// Following the backend one poll at a time.
    Steady,
    /// The backend reorganized past the root; chain truth is lost.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDepth {
    /// Known (watched or being broadcast) but not in any tracked block.
    Unconfirmed,
    /// Number of blocks that would have to be replaced to drop the tx.
    Confirmed(u32),
}

/// A block header with the transactions that may matter when it is connected,
/// keyed by their index in the block.
struct FetchedBlock {
    info: HeaderInfo,
    txs: Vec<(u32, Transaction)>,
}

/// Entries parked on local blocks that a rewind would put back in play.
#[derive(Default)]
struct Parked {
    txids: HashSet<Hash256>,
    outpoints: HashSet<OutPoint>,
}

struct SyncPlan {
    /// Local block to rewind to before connecting; `None` means extend the tip.
    fork: Option<Hash256>,
    connect: Vec<FetchedBlock>,
    best_height: u32,
}

pub struct Topology {
    state: TopologyState,
    chain: Chain,
    watches: WatchRegistry,
    outgoing: BroadcastQueue,
    feerate: Option<u64>,
    config: TopologyConfig,
    backend: Option<Arc<dyn ChainBackend>>,
    events: VecDeque<TopologyEvent>,
}

impl Topology {
    /// An empty, unconfigured topology. Call [`Topology::setup`] before polling.
    pub fn new() -> Self {
        Self {
            state: TopologyState::Init,
            chain: Chain::new(),
            watches: WatchRegistry::new(),
            outgoing: BroadcastQueue::new(),
            feerate: None,
            config: TopologyConfig::default(),
            backend: None,
            events: VecDeque::new(),
        }
    }

    pub fn setup(&mut self, backend: Arc<dyn ChainBackend>, config: TopologyConfig) -> Result<()> {
        if self.state != TopologyState::Init {
            return Err(TopologyError::InvalidInput("topology already set up".to_string()));
        }
        config
            .validate()
            .map_err(|e| TopologyError::Config(e.to_string()))?;

        log::info!(
            "Tracking chain from block {}, polling every {:?}",
            config.first_blocknum,
            config.poll_interval()
        );

        self.backend = Some(backend);
        self.config = config;
        self.state = TopologyState::Syncing;
        Ok(())
    }

    fn backend(&self) -> Result<Arc<dyn ChainBackend>> {
        self.backend.clone().ok_or(TopologyError::NotConfigured)
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn is_startup(&self) -> bool {
        matches!(self.state, TopologyState::Init | TopologyState::Syncing)
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// One reconciliation tick: fee estimate, chain sync, relay retries.
    pub async fn poll(&mut self) -> Result<()> {
        let backend = self.backend()?;
        if self.state == TopologyState::Failed {
            return Err(TopologyError::TopologyCorrupt("topology has failed".to_string()));
        }

        self.refresh_feerate(backend.as_ref()).await;

        if let Err(e) = self.sync_chain(backend.as_ref()).await {
            if e.is_fatal() {
                self.fail(&e);
            }
            return Err(e);
        }

        self.retry_pending(backend.as_ref()).await;
        Ok(())
    }

    async fn refresh_feerate(&mut self, backend: &dyn ChainBackend) {
        match backend.fee_estimate().await {
            Ok(rate) => {
                if self.feerate != Some(rate) {
                    log::debug!("Fee estimate now {} sat/kvB", rate);
                }
                self.feerate = Some(rate);
            }
            Err(e) => log::debug!("Keeping previous fee estimate: {}", e),
        }
    }

    async fn sync_chain(&mut self, backend: &dyn ChainBackend) -> Result<()> {
        if self.chain.tip().is_none() {
            let root = self.fetch_root(backend).await?;
            log::info!("Root block {} at height {}", root.info.hash, root.info.height);
            self.connect_block(root.info, root.txs)?;
        }

        let plan = self.plan_sync(backend).await?;
        self.apply_plan(plan)
    }

    async fn fetch_root(&self, backend: &dyn ChainBackend) -> Result<FetchedBlock> {
        let best_hash = backend.best_block_hash().await?;
        let best = backend.block_header(&best_hash).await?;

        let root_height = self.config.first_blocknum.min(best.height);
        let info = if root_height == best.height {
            best
        } else {
            let hash = backend.block_hash(root_height).await?;
            backend.block_header(&hash).await?
        };
        let txs = backend.block_contents(&info.hash).await?;
        let txs = self.candidates(txs, &Parked::default());

        Ok(FetchedBlock { info, txs })
    }

    /// Work out how the local chain must change to follow the backend.
    async fn plan_sync(&self, backend: &dyn ChainBackend) -> Result<SyncPlan> {
        let (tip_hash, tip_height) = match self.chain.tip() {
            Some(tip) => (tip.hash, tip.height),
            None => return Err(TopologyError::NotConfigured),
        };
        let root_height = self.chain.root().map(|root| root.height).unwrap_or(tip_height);

        let best_hash = backend.best_block_hash().await?;
        if best_hash == tip_hash {
            return Ok(SyncPlan {
                fork: None,
                connect: Vec::new(),
                best_height: tip_height,
            });
        }

        let best = backend.block_header(&best_hash).await?;
        let best_height = best.height;

        let limit = tip_height.saturating_add(self.config.sync_batch);
        let mut cursor = if best.height > limit {
            let hash = backend.block_hash(limit).await?;
            backend.block_header(&hash).await?
        } else {
            best
        };

        let mut segment = Vec::new();
        while !self.chain.contains(&cursor.hash) {
            if cursor.height <= root_height {
                return Err(TopologyError::TopologyCorrupt(format!(
                    "backend chain leaves ours at or below root height {} (block {} at {})",
                    root_height, cursor.hash, cursor.height
                )));
            }
            let prev = cursor.prev_hash();
            segment.push(cursor);
            cursor = backend.block_header(&prev).await?;
        }
        let fork = cursor.hash;

        if fork != tip_hash {
            let depth = tip_height.saturating_sub(cursor.height);
            log::warn!("Reorg: rewinding {} block(s) to {} at height {}", depth, fork, cursor.height);
        }

        let parked = self.parked_above(&fork);
        let mut connect = Vec::with_capacity(segment.len());
        for info in segment.into_iter().rev() {
            let txs = backend.block_contents(&info.hash).await?;
            let txs = self.candidates(txs, &parked);
            connect.push(FetchedBlock { info, txs });
        }

        Ok(SyncPlan {
            fork: Some(fork),
            connect,
            best_height,
        })
    }

    fn apply_plan(&mut self, plan: SyncPlan) -> Result<()> {
        if let Some(fork) = plan.fork {
            while self.chain.tip_hash() != Some(fork) {
                self.disconnect_tip()?;
            }
        }

        for block in plan.connect {
            self.connect_block(block.info, block.txs).map_err(|e| {
                TopologyError::TopologyCorrupt(format!("backend served an inconsistent chain: {}", e))
            })?;
        }

        if let Some(height) = self.chain.height() {
            if self.state == TopologyState::Syncing {
                if height >= plan.best_height {
                    log::info!("Chain synced at height {}", height);
                    self.state = TopologyState::Steady;
                } else {
                    log::info!("Syncing: height {} of {}", height, plan.best_height);
                }
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: &TopologyError) {
        log::error!("Chain topology failed: {}", err);
        self.state = TopologyState::Failed;
        self.events.push_back(TopologyEvent::TopologyCorrupt {
            reason: err.to_string(),
        });
    }

    fn is_relevant(&self, txid: &Hash256, tx: &Transaction) -> bool {
        self.watches.is_watching_txid(txid)
            || self.outgoing.contains(txid)
            || tx
                .input
                .iter()
                .any(|input| self.watches.is_watching_txo(&input.previous_output))
    }

    /// Everything parked on blocks above `fork`, which disconnecting down to it re-arms.
    fn parked_above(&self, fork: &Hash256) -> Parked {
        let mut parked = Parked::default();
        let mut cursor = self.chain.tip_hash();
        while let Some(block) = cursor.filter(|hash| hash != fork).and_then(|hash| self.chain.get(&hash)) {
            parked
                .txids
                .extend(block.confirmed_outgoing.iter().map(|tx| tx.txid));
            parked
                .outpoints
                .extend(block.spent_watches.iter().map(|watch| watch.outpoint));
            cursor = block.prev;
        }
        parked
    }

    /// Keep the transactions of a fetched block that may be relevant once it
    /// is connected, either now or after the planned disconnects.
    fn candidates(&self, txs: Vec<Transaction>, parked: &Parked) -> Vec<(u32, Transaction)> {
        txs.into_iter()
            .enumerate()
            .filter(|(_, tx)| {
                let txid = tx.txid_key();
                self.is_relevant(&txid, tx)
                    || parked.txids.contains(&txid)
                    || tx
                        .input
                        .iter()
                        .any(|input| parked.outpoints.contains(&input.previous_output))
            })
            .map(|(index, tx)| (index as u32, tx))
            .collect()
    }

    /// Append a block to the tip, firing watches and confirming outgoing txs.
    ///
    /// `txs` pairs transactions with their index in the block; any that turn
    /// out not to be relevant are dropped.
    pub fn connect_block(&mut self, info: HeaderInfo, txs: Vec<(u32, Transaction)>) -> Result<()> {
        let mut relevant = Vec::new();
        let mut matched: Vec<(Hash256, u32, Vec<OutPoint>)> = Vec::new();
        for (index, tx) in txs {
            let txid = tx.txid_key();
            if self.is_relevant(&txid, &tx) {
                let spends = tx.input.iter().map(|input| input.previous_output).collect();
                matched.push((txid, index, spends));
                relevant.push((index, tx));
            }
        }

        let block = self.chain.connect(info, relevant)?;
        let (hash, height, mediantime) = (block.hash, block.height, block.mediantime);
        log::debug!("Connected block {} at height {} ({} relevant txs)", hash, height, matched.len());
        self.events.push_back(TopologyEvent::BlockConnected { height, hash });

        let mut spent_watches = Vec::new();
        let mut confirmed = Vec::new();
        for (txid, index, spends) in matched {
            for watch in self.watches.txid_watches(&txid) {
                self.events.push_back(TopologyEvent::TxConfirmed {
                    watch: watch.id,
                    peer: watch.peer,
                    txid,
                    height,
                    index,
                    mediantime,
                });
            }

            for outpoint in spends {
                for watch in self.watches.take_txo_watches(&outpoint) {
                    self.events.push_back(TopologyEvent::TxoSpent {
                        watch: watch.id,
                        peer: watch.peer,
                        outpoint,
                        spender: txid,
                        height,
                        mediantime,
                    });
                    spent_watches.push(watch);
                }
            }

            if let Some(outgoing) = self.outgoing.take(&txid) {
                log::info!("Outgoing tx {} confirmed at height {}", txid, height);
                confirmed.push(outgoing);
            }
        }

        if let Some(block) = self.chain.get_mut(&hash) {
            block.spent_watches = spent_watches;
            block.confirmed_outgoing = confirmed;
        }
        Ok(())
    }

    /// Drop the tip, re-arming everything that only it confirmed.
    pub fn disconnect_tip(&mut self) -> Result<()> {
        let block = self.chain.disconnect_tip()?;
        log::info!("Disconnected block {} at height {}", block.hash, block.height);
        self.events.push_back(TopologyEvent::BlockDisconnected {
            height: block.height,
            hash: block.hash,
        });

        for (txid, _) in &block.txs {
            for watch in self.watches.txid_watches(txid) {
                self.events.push_back(TopologyEvent::TxUnconfirmed {
                    watch: watch.id,
                    peer: watch.peer,
                    txid: *txid,
                });
            }
        }

        for watch in block.spent_watches {
            self.events.push_back(TopologyEvent::TxoUnspent {
                watch: watch.id,
                peer: watch.peer,
                outpoint: watch.outpoint,
            });
            self.watches.rearm_txo(watch);
        }

        for outgoing in block.confirmed_outgoing {
            log::info!("Outgoing tx {} unconfirmed by reorg, relaying again", outgoing.txid);
            self.outgoing.requeue(outgoing);
        }
        Ok(())
    }

    /// Watch `txid`. If it already sits in a tracked block the confirmation
    /// is reported at once, so a later disconnect is matched by `TxUnconfirmed`.
    pub fn watch_txid(&mut self, txid: Hash256, peer: PeerId) -> WatchId {
        let watch = self.watches.watch_txid(txid, peer);

        if let Some(block) = self.chain.block_of(&txid) {
            if let Some(index) = block.tx_index(&txid) {
                self.events.push_back(TopologyEvent::TxConfirmed {
                    watch,
                    peer,
                    txid,
                    height: block.height,
                    index,
                    mediantime: block.mediantime,
                });
            }
        }
        watch
    }

    pub fn watch_txo(&mut self, outpoint: OutPoint, peer: PeerId) -> WatchId {
        self.watches.watch_txo(outpoint, peer)
    }

    /// Remove a watch, including an outpoint watch parked on a block after firing.
    pub fn unwatch(&mut self, id: WatchId) -> bool {
        if self.watches.unwatch(id) {
            return true;
        }

        let mut cursor = self.chain.tip_hash();
        while let Some(block) = cursor.and_then(|hash| self.chain.get_mut(&hash)) {
            let before = block.spent_watches.len();
            block.spent_watches.retain(|watch| watch.id != id);
            if block.spent_watches.len() != before {
                return true;
            }
            cursor = block.prev;
        }
        false
    }

    /// Queue `tx` for relay and offer it to the backend right away.
    pub async fn broadcast_tx(
        &mut self,
        peer: PeerId,
        tx: &Transaction,
        policy: RelayPolicy,
    ) -> Result<Hash256> {
        let backend = self.backend()?;
        let txid = tx.txid_key();

        if let Some(queued) = self.outgoing.get_mut(&txid) {
            if queued.policy != policy {
                if policy == RelayPolicy::ReportFailure {
                    log::info!("Tx {} already queued; now reporting relay failure to {}", txid, peer);
                    queued.policy = policy;
                    queued.peer = peer;
                } else {
                    log::info!("Tx {} already queued with failure reporting; keeping it", txid);
                }
            } else {
                log::debug!("Tx {} already queued for broadcast", txid);
            }
            return Ok(txid);
        }

        let entry = OutgoingTx {
            peer,
            raw: tx.to_raw(),
            txid,
            policy,
        };

        if let Some(block_hash) = self.chain.block_of(&txid).map(|block| block.hash) {
            log::debug!("Tx {} already confirmed in {}", txid, block_hash);
            if let Some(block) = self.chain.get_mut(&block_hash) {
                block.confirmed_outgoing.push(entry);
            }
            return Ok(txid);
        }

        log::info!("Broadcasting tx {} for {}", txid, peer);
        self.outgoing.push(entry);
        self.relay_one(backend.as_ref(), &txid).await;
        Ok(txid)
    }

    async fn retry_pending(&mut self, backend: &dyn ChainBackend) {
        for txid in self.outgoing.txids() {
            self.relay_one(backend, &txid).await;
        }
    }

    async fn relay_one(&mut self, backend: &dyn ChainBackend, txid: &Hash256) {
        let Some(raw) = self.outgoing.get(txid).map(|tx| tx.raw.clone()) else {
            return;
        };

        match backend.relay(&raw).await {
            Ok(RelayOutcome::Accepted) => log::debug!("Backend accepted tx {}", txid),
            Ok(RelayOutcome::Rejected { status, message }) => {
                let policy = self.outgoing.get(txid).map(|tx| tx.policy);
                if policy == Some(RelayPolicy::ReportFailure) {
                    if let Some(tx) = self.outgoing.take(txid) {
                        log::warn!("Broadcast of {} failed ({}): {}", txid, status, message);
                        self.events.push_back(TopologyEvent::RelayFailed {
                            peer: tx.peer,
                            txid: *txid,
                            status,
                            message,
                        });
                    }
                } else {
                    log::debug!("Backend rejected tx {} ({}): {}; will retry", txid, status, message);
                }
            }
            Err(e) => log::warn!("Relay of {} failed, will retry: {}", txid, e),
        }
    }

    pub fn get_block_height(&self) -> Option<u32> {
        self.chain.height()
    }

    /// Mediantime of the tip, 0 without a full window.
    pub fn get_tip_mediantime(&self) -> u32 {
        self.chain.tip().map(|tip| tip.mediantime).unwrap_or(0)
    }

    pub fn locate_tx(&self, txid: &Hash256) -> Result<TxLocator> {
        self.chain.locate(txid).ok_or(TopologyError::TxNotFound(*txid))
    }

    pub fn get_tx_depth(&self, txid: &Hash256) -> Result<TxDepth> {
        if let Some(loc) = self.chain.locate(txid) {
            let tip = self.chain.height().unwrap_or(loc.blkheight);
            return Ok(TxDepth::Confirmed(tip.saturating_sub(loc.blkheight) + 1));
        }

        if self.watches.is_watching_txid(txid) || self.outgoing.contains(txid) {
            Ok(TxDepth::Unconfirmed)
        } else {
            Err(TopologyError::TxNotFound(*txid))
        }
    }

    pub fn get_tx_mediantime(&self, txid: &Hash256) -> Result<u32> {
        self.chain
            .block_of(txid)
            .map(|block| block.mediantime)
            .ok_or(TopologyError::TxNotFound(*txid))
    }

    /// Body of a confirmed transaction we tracked.
    pub fn get_tx(&self, txid: &Hash256) -> Option<&Transaction> {
        self.chain.block_of(txid).and_then(|block| block.full_tx(txid))
    }

    /// Latest fee estimate in sat/kvB, or the configured fallback.
    pub fn get_feerate(&self) -> u64 {
        self.feerate.unwrap_or(self.config.fallback_feerate)
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.outgoing.len()
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.watches
    }

    pub fn drain_events(&mut self) -> Vec<TopologyEvent> {
        self.events.drain(..).collect()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}
