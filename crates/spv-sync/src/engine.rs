//! Sync orchestration.
//!
//! [`SyncEngine`] picks one sync peer at a time and drives it batch by
//! batch: queued block hashes become a [`GetMerkleBlocksTask`], and while
//! header-hash sync is incomplete a [`GetBlockHashesTask`] extends the
//! queue. Peer callbacks arrive from many connection workers; they are
//! turned into [`EngineCommand`]s and handled one at a time by a single
//! worker task, so peer assignment and download iterations never interleave.
//!
//! Merkle blocks are the exception: they are stored directly from the
//! sync peer's connection worker. Only the sync peer is ever given a
//! merkle task, and fork resolution only runs once that peer is ready again
//! or gone.

use crate::listeners::{BlockSyncListener, PeerSyncListener};
use crate::BlockSyncer;
use parking_lot::{Mutex, RwLock};
use spv_consensus::MerkleBlock;
use spv_network::tasks::{
    GetBlockHashesTask, GetMerkleBlocksTask, MerkleBlockHandler, MerkleBlockRejection,
    SlowPeerThresholds,
};
use spv_network::{
    InventoryItem, InventoryItemsHandler, InventoryType, ListenerRegistry, Peer, PeerError,
    PeerGroupListener, PeerManager, PeerTask, PeerTaskHandler, TaskOutcome,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How the engine learns which blocks to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Header-hash sync through `getblocks`, 500-hash batches.
    Initial,
    /// Hashes are queued from announcements, 50-hash batches.
    Incremental,
}

impl SyncStrategy {
    pub fn batch_size(self) -> usize {
        match self {
            SyncStrategy::Initial => 500,
            SyncStrategy::Incremental => 50,
        }
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(SyncStrategy::Initial),
            "incremental" => Ok(SyncStrategy::Incremental),
            other => Err(format!("unknown sync mode: {}", other)),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    /// Starting download-rate minimums.
    pub thresholds: SlowPeerThresholds,
    /// Consecutive slow-peer disconnects before the minimums are relaxed.
    pub slow_disconnects_before_relax: u32,
    /// Divisor applied to the starting minimums when relaxing.
    pub relax_divisor: f64,
    /// A new peer this many times faster than the sync peer replaces it at
    /// the next iteration boundary.
    pub peer_switch_ratio: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::Initial,
            thresholds: SlowPeerThresholds::default(),
            slow_disconnects_before_relax: 3,
            relax_divisor: 3.0,
            peer_switch_ratio: 1.5,
        }
    }
}

/// Tracks consecutive slow-peer disconnects.
#[derive(Debug, Clone)]
struct SlowPeerPolicy {
    base: SlowPeerThresholds,
    current: SlowPeerThresholds,
    streak: u32,
    limit: u32,
    divisor: f64,
}

impl SlowPeerPolicy {
    fn new(config: &SyncConfig) -> Self {
        Self {
            base: config.thresholds,
            current: config.thresholds,
            streak: 0,
            limit: config.slow_disconnects_before_relax.max(1),
            divisor: config.relax_divisor,
        }
    }

    /// Returns true when the thresholds were relaxed.
    fn record_disconnect(&mut self, error: Option<&PeerError>) -> bool {
        match error {
            Some(PeerError::PeerTooSlow(_)) => {
                self.streak += 1;
                if self.streak >= self.limit {
                    self.streak = 0;
                    self.current = self.base.relaxed(self.divisor);
                    return true;
                }
                false
            }
            Some(_) => {
                self.streak = 0;
                false
            }
            None => false,
        }
    }
}

/// Whether `candidate` connected fast enough to replace `current`.
fn is_much_faster(current: Option<Duration>, candidate: Option<Duration>, ratio: f64) -> bool {
    match (current, candidate) {
        (Some(current), Some(candidate)) => current.as_secs_f64() > candidate.as_secs_f64() * ratio,
        _ => false,
    }
}

enum EngineCommand {
    Start,
    Stop,
    Refresh,
    PeerConnect(Arc<Peer>),
    PeerReady(Arc<Peer>),
    PeerDisconnect(Arc<Peer>, Option<PeerError>),
    Inventory(Arc<Peer>, Vec<InventoryItem>),
    TaskCompleted(Arc<Peer>, TaskOutcome),
    Barrier(oneshot::Sender<()>),
}

/// State readable outside the worker.
struct Shared {
    block_syncer: Arc<BlockSyncer>,
    sync_peer: RwLock<Option<Arc<Peer>>>,
    synced_peers: RwLock<Vec<Arc<Peer>>>,
    thresholds: RwLock<SlowPeerThresholds>,
    max_block_height: AtomicU32,
}

impl MerkleBlockHandler for Shared {
    fn handle_merkle_block(&self, block: MerkleBlock) -> Result<(), MerkleBlockRejection> {
        let max = self.max_block_height.load(Ordering::SeqCst);
        self.block_syncer
            .handle_merkle_block(&block, max)
            .map_err(MerkleBlockRejection::from)
    }
}

/// Block download orchestrator.
pub struct SyncEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    shared: Arc<Shared>,
    strategy: SyncStrategy,
    peer_sync_listeners: Arc<ListenerRegistry<dyn PeerSyncListener>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create the engine and spawn its worker. Must be called within a
    /// Tokio runtime.
    pub fn new(
        config: SyncConfig,
        block_syncer: Arc<BlockSyncer>,
        peer_manager: Arc<PeerManager>,
        sync_listeners: Arc<ListenerRegistry<dyn BlockSyncListener>>,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            block_syncer,
            sync_peer: RwLock::new(None),
            synced_peers: RwLock::new(Vec::new()),
            thresholds: RwLock::new(config.thresholds),
            max_block_height: AtomicU32::new(0),
        });
        let peer_sync_listeners: Arc<ListenerRegistry<dyn PeerSyncListener>> =
            Arc::new(ListenerRegistry::new());

        let worker = Worker {
            strategy: config.strategy,
            slow_peers: SlowPeerPolicy::new(&config),
            peer_switch_ratio: config.peer_switch_ratio,
            shared: shared.clone(),
            peer_manager,
            sync_listeners,
            peer_sync_listeners: peer_sync_listeners.clone(),
            select_new_peer: false,
            stalled: false,
            running: false,
        };
        let handle = tokio::spawn(worker.run(receiver));

        Arc::new(Self {
            commands,
            shared,
            strategy: config.strategy,
            peer_sync_listeners,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn add_peer_sync_listener(&self, listener: Arc<dyn PeerSyncListener>) {
        self.peer_sync_listeners.add(listener);
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    pub fn block_syncer(&self) -> &Arc<BlockSyncer> {
        &self.shared.block_syncer
    }

    /// The peer currently being synced from.
    pub fn sync_peer(&self) -> Option<Arc<Peer>> {
        self.shared.sync_peer.read().clone()
    }

    /// Peers that have no more blocks for us.
    pub fn synced_peers(&self) -> Vec<Arc<Peer>> {
        self.shared.synced_peers.read().clone()
    }

    /// Download-rate minimums given to new merkle tasks.
    pub fn thresholds(&self) -> SlowPeerThresholds {
        *self.shared.thresholds.read()
    }

    /// Mark every connected peer unsynced and resync when idle.
    pub fn refresh(&self) {
        self.send(EngineCommand::Refresh);
    }

    /// Resolves once every command queued before it has been handled.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Barrier(tx));
        let _ = rx.await;
    }

    /// Stop the worker. Pending commands are dropped.
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            debug!("Sync engine worker is gone");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PeerGroupListener for SyncEngine {
    fn on_start(&self) {
        self.send(EngineCommand::Start);
    }

    fn on_stop(&self) {
        self.send(EngineCommand::Stop);
    }

    fn on_peer_create(&self, peer: &Arc<Peer>) {
        match self.shared.block_syncer.local_downloaded_best_block_height() {
            Ok(height) => peer.set_local_best_height(height),
            Err(e) => warn!(peer = %peer.host(), error = %e, "Cannot read local height"),
        }
    }

    fn on_peer_connect(&self, peer: &Arc<Peer>) {
        self.send(EngineCommand::PeerConnect(peer.clone()));
    }

    fn on_peer_disconnect(&self, peer: &Arc<Peer>, error: Option<&PeerError>) {
        self.send(EngineCommand::PeerDisconnect(peer.clone(), error.cloned()));
    }

    fn on_peer_ready(&self, peer: &Arc<Peer>) {
        self.send(EngineCommand::PeerReady(peer.clone()));
    }
}

impl InventoryItemsHandler for SyncEngine {
    fn handle_inventory_items(&self, peer: &Arc<Peer>, items: Vec<InventoryItem>) {
        if items.iter().any(|i| i.kind == InventoryType::Block) {
            self.send(EngineCommand::Inventory(peer.clone(), items));
        }
    }
}

impl PeerTaskHandler for SyncEngine {
    fn handle_completed_task(&self, peer: &Arc<Peer>, task: Box<dyn PeerTask>) {
        let name = task.name();
        let outcome = task.into_outcome();
        debug!(peer = %peer.host(), task = name, "Task completed");
        self.send(EngineCommand::TaskCompleted(peer.clone(), outcome));
    }
}

/// Owns the orchestration state; runs on a single task.
struct Worker {
    strategy: SyncStrategy,
    slow_peers: SlowPeerPolicy,
    peer_switch_ratio: f64,
    shared: Arc<Shared>,
    peer_manager: Arc<PeerManager>,
    sync_listeners: Arc<ListenerRegistry<dyn BlockSyncListener>>,
    peer_sync_listeners: Arc<ListenerRegistry<dyn PeerSyncListener>>,
    select_new_peer: bool,
    /// The last batch connected nothing; the sync peer has no usable data.
    stalled: bool,
    running: bool,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = receiver.recv().await {
            self.handle(command);
        }
        debug!("Sync engine worker stopped");
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start => self.on_start(),
            EngineCommand::Stop => self.on_stop(),
            EngineCommand::Refresh => self.on_refresh(),
            EngineCommand::PeerConnect(peer) => self.on_peer_connect(&peer),
            EngineCommand::PeerReady(peer) => {
                if self.is_sync_peer(&peer) {
                    self.download_blockchain();
                }
            }
            EngineCommand::PeerDisconnect(peer, error) => self.on_peer_disconnect(&peer, error),
            EngineCommand::Inventory(peer, items) => self.on_inventory(&peer, &items),
            EngineCommand::TaskCompleted(peer, outcome) => self.on_task_completed(&peer, outcome),
            EngineCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn on_start(&mut self) {
        self.running = true;
        if let Err(e) = self.shared.block_syncer.prepare_for_download() {
            warn!(error = %e, "Failed to prepare for download");
        }
    }

    fn on_stop(&mut self) {
        self.running = false;
        self.set_sync_peer(None);
        self.sync_listeners.notify(|l| l.on_sync_stop(None));
    }

    fn on_refresh(&mut self) {
        if self.sync_peer().is_some() {
            return;
        }
        for peer in self.peer_manager.connected() {
            peer.set_synced(false);
        }
        self.shared.synced_peers.write().clear();
        self.assign_next_sync_peer();
    }

    fn on_peer_connect(&mut self, peer: &Arc<Peer>) {
        if let Some(current) = self.sync_peer() {
            if is_much_faster(
                current.connection_time(),
                peer.connection_time(),
                self.peer_switch_ratio,
            ) {
                debug!(current = %current.host(), candidate = %peer.host(), "Faster peer available");
                self.select_new_peer = true;
            }
        }
        self.assign_next_sync_peer();
    }

    fn on_peer_disconnect(&mut self, peer: &Arc<Peer>, error: Option<PeerError>) {
        if self.slow_peers.record_disconnect(error.as_ref()) {
            let relaxed = self.slow_peers.current;
            info!(
                merkle_blocks = relaxed.merkle_blocks,
                transactions = relaxed.transactions,
                bytes = relaxed.bytes,
                "Relaxing slow peer thresholds"
            );
            *self.shared.thresholds.write() = relaxed;
        }

        self.shared
            .synced_peers
            .write()
            .retain(|p| !Arc::ptr_eq(p, peer));

        if self.is_sync_peer(peer) {
            info!(peer = %peer.host(), "Sync peer disconnected");
            self.set_sync_peer(None);
            if let Err(e) = self.shared.block_syncer.download_failed() {
                warn!(error = %e, "Failed to reset after sync peer loss");
            }
            self.assign_next_sync_peer();
        }
    }

    fn on_inventory(&mut self, peer: &Arc<Peer>, items: &[InventoryItem]) {
        if self.strategy == SyncStrategy::Incremental {
            self.queue_announced_blocks(items);
        }

        if peer.synced() {
            debug!(peer = %peer.host(), "Synced peer announced a block");
            peer.set_synced(false);
            peer.set_block_hashes_synced(false);
            self.shared
                .synced_peers
                .write()
                .retain(|p| !Arc::ptr_eq(p, peer));
            self.assign_next_sync_peer();
        }
    }

    fn queue_announced_blocks(&self, items: &[InventoryItem]) {
        let syncer = &self.shared.block_syncer;
        let mut hashes = Vec::new();
        for item in items.iter().filter(|i| i.kind == InventoryType::Block) {
            match syncer.should_request(&item.hash) {
                Ok(true) => hashes.push(item.hash),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Cannot check announced block"),
            }
        }
        if let Err(e) = syncer.add_block_hashes(&hashes) {
            warn!(error = %e, "Cannot queue announced blocks");
        }
    }

    fn on_task_completed(&mut self, peer: &Arc<Peer>, outcome: TaskOutcome) {
        let syncer = &self.shared.block_syncer;
        let result = match outcome {
            TaskOutcome::BlockHashes(hashes) if hashes.is_empty() => {
                debug!(peer = %peer.host(), "Block hashes synced");
                peer.set_block_hashes_synced(true);
                Ok(())
            }
            TaskOutcome::BlockHashes(hashes) => syncer.add_block_hashes(&hashes),
            TaskOutcome::MerkleBlocks { delivered, deferred } => {
                debug!(peer = %peer.host(), delivered, deferred, "Merkle block batch done");
                if delivered == 0 && self.is_sync_peer(peer) {
                    self.stalled = true;
                }
                syncer.download_iteration_completed()
            }
        };
        if let Err(e) = result {
            warn!(peer = %peer.host(), error = %e, "Failed to handle task result");
        }
    }

    fn assign_next_sync_peer(&mut self) {
        if !self.running || self.sync_peer().is_some() {
            return;
        }

        let not_synced: Vec<Arc<Peer>> = self
            .peer_manager
            .sorted()
            .into_iter()
            .filter(|p| !p.synced())
            .collect();
        if not_synced.is_empty() {
            self.peer_sync_listeners.notify(|l| l.on_all_peers_synced());
            return;
        }

        if let Some(peer) = not_synced.into_iter().find(|p| p.ready()) {
            info!(peer = %peer.host(), height = peer.announced_height(), "Start syncing peer");
            self.stalled = false;
            self.set_sync_peer(Some(peer));
            self.sync_listeners.notify(|l| l.on_sync_start());
            self.download_blockchain();
        }
    }

    fn download_blockchain(&mut self) {
        if let Err(e) = self.download_iteration() {
            warn!(error = %e, "Download iteration failed");
            if let Some(peer) = self.sync_peer() {
                peer.close(Some(e.into()));
            }
        }
    }

    fn download_iteration(&mut self) -> crate::SyncResult<()> {
        let Some(peer) = self.sync_peer() else {
            return Ok(());
        };
        if !peer.ready() {
            return Ok(());
        }

        let syncer = self.shared.block_syncer.clone();

        if self.select_new_peer {
            self.select_new_peer = false;
            syncer.download_completed()?;
            self.set_sync_peer(None);
            self.assign_next_sync_peer();
            return Ok(());
        }

        let hashes = syncer.get_block_hashes(self.strategy.batch_size())?;
        if self.stalled {
            // The queue came from this peer's chain; the next peer rebuilds it.
            self.stalled = false;
            warn!(peer = %peer.host(), queued = hashes.len(), "No queued block connects, pausing peer");
            syncer.download_failed()?;
            peer.set_synced(true);
        } else if hashes.is_empty() {
            let synced = match self.strategy {
                SyncStrategy::Initial => peer.block_hashes_synced(),
                SyncStrategy::Incremental => true,
            };
            peer.set_synced(synced);
        } else {
            let thresholds = *self.shared.thresholds.read();
            debug!(peer = %peer.host(), count = hashes.len(), "Requesting merkle blocks");
            let handler: Arc<dyn MerkleBlockHandler> = self.shared.clone();
            peer.add_task(Box::new(GetMerkleBlocksTask::new(hashes, handler, thresholds)));
        }

        if self.strategy == SyncStrategy::Initial && !peer.synced() && !peer.block_hashes_synced() {
            let announced = peer.announced_height();
            let expected = announced.saturating_sub(syncer.local_known_best_block_height()?);
            let locator = syncer.get_block_locator_hashes(announced)?;
            peer.add_task(Box::new(GetBlockHashesTask::new(locator, expected as usize)));
        }

        if peer.synced() {
            self.shared.synced_peers.write().push(peer.clone());
            syncer.download_completed()?;
            peer.send_mempool();
            info!(peer = %peer.host(), "Peer synced");
            self.set_sync_peer(None);

            self.peer_sync_listeners.notify(|l| l.on_peer_synced(&peer));
            if syncer.local_downloaded_best_block_height()? >= peer.announced_height() {
                self.sync_listeners.notify(|l| l.on_block_sync_finished());
            }
            self.assign_next_sync_peer();
        }
        Ok(())
    }

    fn sync_peer(&self) -> Option<Arc<Peer>> {
        self.shared.sync_peer.read().clone()
    }

    fn is_sync_peer(&self, peer: &Arc<Peer>) -> bool {
        self.shared
            .sync_peer
            .read()
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, peer))
    }

    fn set_sync_peer(&self, peer: Option<Arc<Peer>>) {
        let height = peer.as_ref().map(|p| p.announced_height()).unwrap_or(0);
        self.shared.max_block_height.store(height, Ordering::SeqCst);
        *self.shared.sync_peer.write() = peer;
    }
}
