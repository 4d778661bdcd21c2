//! Runs a [`Topology`] inside one task and serves requests between ticks.

use std::future::Future;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::core::{OutPoint, Transaction};
use crate::crypto::hash::Hash256;
use crate::topology::{
    PeerId, RelayPolicy, Topology, TopologyEvent, TopologyState, TxDepth, TxLocator, WatchId,
};
use crate::{Result, TopologyError};

#[derive(Debug)]
pub enum TopologyCommand {
    WatchTxid {
        txid: Hash256,
        peer: PeerId,
        reply: oneshot::Sender<WatchId>,
    },
    WatchTxo {
        outpoint: OutPoint,
        peer: PeerId,
        reply: oneshot::Sender<WatchId>,
    },
    Unwatch {
        id: WatchId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        peer: PeerId,
        tx: Transaction,
        policy: RelayPolicy,
        reply: oneshot::Sender<Result<Hash256>>,
    },
    TxDepth {
        txid: Hash256,
        reply: oneshot::Sender<Result<TxDepth>>,
    },
    TxMediantime {
        txid: Hash256,
        reply: oneshot::Sender<Result<u32>>,
    },
    LocateTx {
        txid: Hash256,
        reply: oneshot::Sender<Result<TxLocator>>,
    },
    GetTx {
        txid: Hash256,
        reply: oneshot::Sender<Option<Transaction>>,
    },
    Status {
        reply: oneshot::Sender<TopologyStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyStatus {
    pub state: TopologyState,
    pub height: Option<u32>,
    pub tip_hash: Option<String>,
    pub tip_mediantime: u32,
    pub feerate: u64,
    pub pending_broadcasts: usize,
    pub txid_watches: usize,
    pub txo_watches: usize,
}

/// Cloneable client side of a running [`TopologyService`].
#[derive(Debug, Clone)]
pub struct TopologyHandle {
    sender: mpsc::Sender<TopologyCommand>,
}

impl TopologyHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> TopologyCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| TopologyError::ServiceStopped)?;
        response.await.map_err(|_| TopologyError::ServiceStopped)
    }

    pub async fn watch_txid(&self, txid: Hash256, peer: PeerId) -> Result<WatchId> {
        self.request(|reply| TopologyCommand::WatchTxid { txid, peer, reply }).await
    }

    pub async fn watch_txo(&self, outpoint: OutPoint, peer: PeerId) -> Result<WatchId> {
        self.request(|reply| TopologyCommand::WatchTxo { outpoint, peer, reply }).await
    }

    pub async fn unwatch(&self, id: WatchId) -> Result<bool> {
        self.request(|reply| TopologyCommand::Unwatch { id, reply }).await
    }

    pub async fn broadcast_tx(
        &self,
        peer: PeerId,
        tx: Transaction,
        policy: RelayPolicy,
    ) -> Result<Hash256> {
        self.request(|reply| TopologyCommand::Broadcast { peer, tx, policy, reply })
            .await?
    }

    pub async fn get_tx_depth(&self, txid: Hash256) -> Result<TxDepth> {
        self.request(|reply| TopologyCommand::TxDepth { txid, reply }).await?
    }

    pub async fn get_tx_mediantime(&self, txid: Hash256) -> Result<u32> {
        self.request(|reply| TopologyCommand::TxMediantime { txid, reply }).await?
    }

    pub async fn locate_tx(&self, txid: Hash256) -> Result<TxLocator> {
        self.request(|reply| TopologyCommand::LocateTx { txid, reply }).await?
    }

    pub async fn get_tx(&self, txid: Hash256) -> Result<Option<Transaction>> {
        self.request(|reply| TopologyCommand::GetTx { txid, reply }).await
    }

    pub async fn status(&self) -> Result<TopologyStatus> {
        self.request(|reply| TopologyCommand::Status { reply }).await
    }
}

pub struct TopologyService {
    topology: Topology,
    commands: mpsc::Receiver<TopologyCommand>,
    events: mpsc::UnboundedSender<TopologyEvent>,
}

impl TopologyService {
    /// Wrap a set-up topology. Events are forwarded to the returned receiver.
    pub fn new(
        topology: Topology,
    ) -> (Self, TopologyHandle, mpsc::UnboundedReceiver<TopologyEvent>) {
        let (sender, commands) = mpsc::channel(100);
        let (events, event_receiver) = mpsc::unbounded_channel();

        let service = Self {
            topology,
            commands,
            events,
        };
        (service, TopologyHandle { sender }, event_receiver)
    }

    /// Poll on every interval tick until `shutdown` resolves.
    ///
    /// Returns an error only when the topology fails for good.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.topology.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut accepting = true;

        log::info!("🚀 Chain topology service started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("🛑 Chain topology service shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let result = self.topology.poll().await;
                    self.flush_events();
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => log::warn!("Chain poll failed, retrying next tick: {}", e),
                    }
                }
                command = self.commands.recv(), if accepting => {
                    match command {
                        Some(cmd) => {
                            self.handle_command(cmd).await;
                            self.flush_events();
                        }
                        None => accepting = false,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: TopologyCommand) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            TopologyCommand::WatchTxid { txid, peer, reply } => {
                let _ = reply.send(self.topology.watch_txid(txid, peer));
            }
            TopologyCommand::WatchTxo { outpoint, peer, reply } => {
                let _ = reply.send(self.topology.watch_txo(outpoint, peer));
            }
            TopologyCommand::Unwatch { id, reply } => {
                let _ = reply.send(self.topology.unwatch(id));
            }
            TopologyCommand::Broadcast {
                peer,
                tx,
                policy,
                reply,
            } => {
                let result = self.topology.broadcast_tx(peer, &tx, policy).await;
                let _ = reply.send(result);
            }
            TopologyCommand::TxDepth { txid, reply } => {
                let _ = reply.send(self.topology.get_tx_depth(&txid));
            }
            TopologyCommand::TxMediantime { txid, reply } => {
                let _ = reply.send(self.topology.get_tx_mediantime(&txid));
            }
            TopologyCommand::LocateTx { txid, reply } => {
                let _ = reply.send(self.topology.locate_tx(&txid));
            }
            TopologyCommand::GetTx { txid, reply } => {
                let _ = reply.send(self.topology.get_tx(&txid).cloned());
            }
            TopologyCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> TopologyStatus {
        TopologyStatus {
            state: self.topology.state(),
            height: self.topology.get_block_height(),
            tip_hash: self.topology.chain().tip_hash().map(|hash| hash.to_hex()),
            tip_mediantime: self.topology.get_tip_mediantime(),
            feerate: self.topology.get_feerate(),
            pending_broadcasts: self.topology.pending_broadcasts(),
            txid_watches: self.topology.watches().txid_watch_count(),
            txo_watches: self.topology.watches().txo_watch_count(),
        }
    }

    fn flush_events(&mut self) {
        for event in self.topology.drain_events() {
            if self.events.send(event).is_err() {
                log::debug!("No event listener, dropping topology events");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::TopologyConfig;
    use crate::core::transaction::{sample_outpoint, sample_spend};
    use crate::core::TransactionExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_service(
        backend: &Arc<MemoryBackend>,
    ) -> (
        TopologyHandle,
        mpsc::UnboundedReceiver<TopologyEvent>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let mut topology = Topology::new();
        topology
            .setup(
                backend.clone(),
                TopologyConfig {
                    poll_interval_ms: 10,
                    ..TopologyConfig::default()
                },
            )
            .unwrap();

        let (service, handle, events) = TopologyService::new(topology);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(service.run(async {
            let _ = stopped.await;
        }));
        (handle, events, stop, task)
    }

    async fn wait_for<F: Fn(&TopologyEvent) -> bool>(
        events: &mut mpsc::UnboundedReceiver<TopologyEvent>,
        pred: F,
    ) -> TopologyEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    fn tx(tag: u8) -> Transaction {
        sample_spend(sample_outpoint(tag, 0), 5_000)
    }

    #[tokio::test]
    async fn test_service_reports_confirmation_and_depth() {
        let backend = Arc::new(MemoryBackend::new());
        let (handle, mut events, stop, task) = spawn_service(&backend);

        let wanted = tx(1);
        let txid = wanted.txid_key();
        let watch = handle.watch_txid(txid, PeerId(1)).await.unwrap();
        assert_eq!(handle.get_tx_depth(txid).await.unwrap(), TxDepth::Unconfirmed);

        backend.mine(vec![wanted.clone()]);
        let event = wait_for(&mut events, |e| matches!(e, TopologyEvent::TxConfirmed { .. })).await;
        assert!(matches!(event, TopologyEvent::TxConfirmed { watch: w, height: 1, .. } if w == watch));

        assert_eq!(handle.get_tx_depth(txid).await.unwrap(), TxDepth::Confirmed(1));
        assert_eq!(handle.locate_tx(txid).await.unwrap().blkheight, 1);
        assert_eq!(handle.get_tx(txid).await.unwrap(), Some(wanted));

        let status = handle.status().await.unwrap();
        assert_eq!(status.height, Some(1));
        assert_eq!(status.state, TopologyState::Steady);
        assert_eq!(status.txid_watches, 1);

        stop.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_service_broadcast_is_relayed() {
        let backend = Arc::new(MemoryBackend::new());
        let (handle, _events, stop, task) = spawn_service(&backend);

        let ours = tx(2);
        let txid = handle
            .broadcast_tx(PeerId(3), ours.clone(), RelayPolicy::RetryUntilConfirmed)
            .await
            .unwrap();
        assert_eq!(txid, ours.txid_key());
        assert_eq!(backend.relayed()[0], ours.to_raw());
        assert_eq!(handle.status().await.unwrap().pending_broadcasts, 1);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_service_follows_reorg() {
        let backend = Arc::new(MemoryBackend::new());
        backend.mine_empty(3);
        let (handle, mut events, stop, task) = spawn_service(&backend);
        wait_for(&mut events, |e| matches!(e, TopologyEvent::BlockConnected { height: 3, .. })).await;

        backend.rewind(2);
        let new_tip = backend.mine_empty(3)[2];
        wait_for(&mut events, |e| matches!(e, TopologyEvent::BlockDisconnected { height: 2, .. })).await;
        wait_for(&mut events, |e| matches!(e, TopologyEvent::BlockConnected { height: 4, .. })).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.height, Some(4));
        assert_eq!(status.tip_hash, Some(new_tip.to_hex()));

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_service_stops_on_corruption() {
        let backend = Arc::new(MemoryBackend::new());
        let mut topology = Topology::new();
        topology
            .setup(
                backend.clone(),
                TopologyConfig {
                    poll_interval_ms: 10,
                    first_blocknum: 2,
                    ..TopologyConfig::default()
                },
            )
            .unwrap();
        backend.mine_empty(3);

        let (service, handle, mut events) = TopologyService::new(topology);
        let task = tokio::spawn(service.run(std::future::pending()));
        wait_for(&mut events, |e| matches!(e, TopologyEvent::BlockConnected { height: 3, .. })).await;

        // Replace the root block itself.
        backend.rewind(2);
        backend.mine_empty(3);

        let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(TopologyError::TopologyCorrupt(_))));
        wait_for(&mut events, |e| matches!(e, TopologyEvent::TopologyCorrupt { .. })).await;
        assert!(matches!(handle.status().await, Err(TopologyError::ServiceStopped)));
    }
}
