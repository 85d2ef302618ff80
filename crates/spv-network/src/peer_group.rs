//! Connection pool daemon.
//!
//! [`PeerGroup`] keeps `peer_count` peers alive. Addresses come from the
//! [`PeerAddressManager`]; every disconnect scores the address and triggers
//! a refill. Lifecycle events fan out to [`PeerGroupListener`]s, inventory
//! announcements go to the [`InventoryItemsHandler`], completed tasks go to
//! the [`PeerTaskHandler`].

use crate::listeners::ListenerRegistry;
use crate::message::TimestampedAddress;
use crate::{
    ConnectionConfig, InventoryItem, Message, Peer, PeerAddressManager, PeerError, PeerListener,
    PeerManager, PeerTask,
};
use parking_lot::{Mutex, RwLock};
use spv_consensus::params::SERVICE_BLOOM_FILTER;
use spv_consensus::MerkleBlockExtractor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peer pool lifecycle callbacks. Every method defaults to a no-op.
pub trait PeerGroupListener: Send + Sync {
    fn on_start(&self) {}
    fn on_stop(&self) {}
    fn on_peer_create(&self, _peer: &Arc<Peer>) {}
    fn on_peer_connect(&self, _peer: &Arc<Peer>) {}
    fn on_peer_disconnect(&self, _peer: &Arc<Peer>, _error: Option<&PeerError>) {}
    fn on_peer_ready(&self, _peer: &Arc<Peer>) {}
}

/// Receives `inv` announcements that no task consumed.
pub trait InventoryItemsHandler: Send + Sync {
    fn handle_inventory_items(&self, peer: &Arc<Peer>, items: Vec<InventoryItem>);
}

/// Receives finished peer tasks.
pub trait PeerTaskHandler: Send + Sync {
    fn handle_completed_task(&self, peer: &Arc<Peer>, task: Box<dyn PeerTask>);
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PeerGroupConfig {
    /// Connections to hold.
    pub peer_count: usize,
    /// Connect budget when far behind the network.
    pub connect_max: usize,
    /// Height gap that counts as "far behind".
    pub acceptable_height_difference: u32,
    /// Learn addresses from `addr` messages.
    pub handle_addr: bool,
    /// Supervisor period.
    pub refresh_interval: Duration,
    /// Largest block accepted from peers.
    pub max_block_size: u32,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            peer_count: 10,
            connect_max: 100,
            acceptable_height_difference: 50_000,
            handle_addr: true,
            refresh_interval: Duration::from_secs(5),
            max_block_size: 1_000_000,
        }
    }
}

/// Maintains the peer pool.
pub struct PeerGroup {
    config: PeerGroupConfig,
    connection: ConnectionConfig,
    address_manager: Arc<PeerAddressManager>,
    peer_manager: Arc<PeerManager>,
    listeners: ListenerRegistry<dyn PeerGroupListener>,
    inventory_handler: RwLock<Option<Arc<dyn InventoryItemsHandler>>>,
    task_handler: RwLock<Option<Arc<dyn PeerTaskHandler>>>,
    running: AtomicBool,
    local_best_height: AtomicU32,
    /// Decided on the first successful connect.
    connect_budget: Mutex<Option<usize>>,
    peers_created: AtomicUsize,
    connecting: Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    this: Weak<PeerGroup>,
}

impl PeerGroup {
    pub fn new(
        config: PeerGroupConfig,
        connection: ConnectionConfig,
        address_manager: Arc<PeerAddressManager>,
        peer_manager: Arc<PeerManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            connection,
            address_manager,
            peer_manager,
            listeners: ListenerRegistry::new(),
            inventory_handler: RwLock::new(None),
            task_handler: RwLock::new(None),
            running: AtomicBool::new(false),
            local_best_height: AtomicU32::new(0),
            connect_budget: Mutex::new(None),
            peers_created: AtomicUsize::new(0),
            connecting: Mutex::new(()),
            supervisor: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn PeerGroupListener>) {
        self.listeners.add(listener);
    }

    pub fn set_inventory_items_handler(&self, handler: Arc<dyn InventoryItemsHandler>) {
        *self.inventory_handler.write() = Some(handler);
    }

    pub fn set_peer_task_handler(&self, handler: Arc<dyn PeerTaskHandler>) {
        *self.task_handler.write() = Some(handler);
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn address_manager(&self) -> &Arc<PeerAddressManager> {
        &self.address_manager
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Height handed to new peers for version validation.
    pub fn set_local_best_height(&self, height: u32) {
        self.local_best_height.store(height, Ordering::SeqCst);
    }

    pub fn local_best_height(&self) -> u32 {
        self.local_best_height.load(Ordering::SeqCst)
    }

    /// Peers created since the last start.
    pub fn peers_created(&self) -> usize {
        self.peers_created.load(Ordering::SeqCst)
    }

    /// Start connecting. Does nothing when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer_count = self.config.peer_count, "Starting peer group");

        self.peers_created.store(0, Ordering::SeqCst);
        self.listeners.notify(|l| l.on_start());
        self.connect_peers_if_required();

        let weak = Arc::downgrade(self);
        let added = self.address_manager.added();
        let period = self.config.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = added.notified() => debug!("New addresses available"),
                }
                let Some(group) = weak.upgrade() else { break };
                if !group.is_running() {
                    break;
                }
                group.connect_peers_if_required();
            }
        });
        *self.supervisor.lock() = Some(handle);
    }

    /// Disconnect every peer and stop refilling the pool.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping peer group");

        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.peer_manager.disconnect_all();
        self.listeners.notify(|l| l.on_stop());
    }

    /// Open connections until the pool is full or addresses run out.
    pub fn connect_peers_if_required(&self) {
        let _guard = self.connecting.lock();
        if !self.is_running() {
            return;
        }

        for _ in self.peer_manager.peers_count()..self.config.peer_count {
            let ip = match self.address_manager.get_ip() {
                Ok(Some(ip)) => ip,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to pick peer address");
                    break;
                }
            };

            let listener: Weak<dyn PeerListener> = self.this.clone();
            let peer = Peer::new(
                ip,
                self.connection.clone(),
                MerkleBlockExtractor::new(self.config.max_block_size),
                listener,
            );
            peer.set_local_best_height(self.local_best_height());

            self.peers_created.fetch_add(1, Ordering::SeqCst);
            self.listeners.notify(|l| l.on_peer_create(&peer));
            self.peer_manager.add(peer.clone());
            debug!(peer = %peer.host(), "Connecting to peer");
            peer.start();
        }
    }

    fn decide_connect_budget(&self, peer: &Arc<Peer>) -> usize {
        let gap = peer.announced_height().saturating_sub(self.local_best_height());
        if gap > self.config.acceptable_height_difference {
            info!(peer = %peer.host(), gap, "Far behind the network, cycling peers");
            self.config.connect_max
        } else {
            0
        }
    }

    /// While catching up from far behind, drop the slowest peer so that
    /// fresh addresses get a chance.
    fn disconnect_slowest_peer(&self, budget: usize) {
        if budget <= self.peers_created() || self.config.peer_count <= 1 {
            return;
        }
        match self.address_manager.has_fresh_ips() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "Failed to query peer addresses");
                return;
            }
        }

        let sorted = self.peer_manager.sorted();
        if sorted.len() >= self.config.peer_count {
            if let Some(slowest) = sorted.last() {
                debug!(peer = %slowest.host(), "Disconnecting slowest peer");
                slowest.close(None);
            }
        }
    }

    fn handle_addr(&self, addresses: Vec<TimestampedAddress>) {
        let ips: Vec<String> = addresses
            .into_iter()
            .filter(|a| a.address.services & SERVICE_BLOOM_FILTER == SERVICE_BLOOM_FILTER)
            .filter_map(|a| a.address.ipv4())
            .map(|ip| ip.to_string())
            .collect();

        if ips.is_empty() {
            return;
        }
        if let Err(e) = self.address_manager.add_ips(&ips) {
            warn!(error = %e, "Failed to store advertised addresses");
        }
    }
}

impl PeerListener for PeerGroup {
    fn on_connect(&self, peer: &Arc<Peer>) {
        if let Some(latency) = peer.connection_time() {
            if let Err(e) = self.address_manager.mark_connected(peer.host(), latency) {
                warn!(peer = %peer.host(), error = %e, "Failed to record connection time");
            }
        }
        self.listeners.notify(|l| l.on_peer_connect(peer));

        let budget = {
            let mut budget = self.connect_budget.lock();
            match *budget {
                Some(b) => Some(b),
                None => {
                    *budget = Some(self.decide_connect_budget(peer));
                    None
                }
            }
        };
        if let Some(budget) = budget {
            self.disconnect_slowest_peer(budget);
        }
    }

    fn on_ready(&self, peer: &Arc<Peer>) {
        self.listeners.notify(|l| l.on_peer_ready(peer));
    }

    fn on_disconnect(&self, peer: &Arc<Peer>, error: Option<PeerError>) {
        self.peer_manager.remove(peer.host());

        let result = match &error {
            None => self.address_manager.mark_success(peer.host()),
            Some(e) if e.is_timeout() => {
                warn!(peer = %peer.host(), error = %e, "Peer timed out");
                self.address_manager.mark_success(peer.host())
            }
            Some(e) => {
                warn!(peer = %peer.host(), error = %e, "Peer failed");
                self.address_manager.mark_failed(peer.host())
            }
        };
        if let Err(e) = result {
            warn!(peer = %peer.host(), error = %e, "Failed to score peer address");
        }

        self.listeners
            .notify(|l| l.on_peer_disconnect(peer, error.as_ref()));
        self.connect_peers_if_required();
    }

    fn on_receive_message(&self, peer: &Arc<Peer>, message: Message) {
        match message {
            Message::Addr(addresses) if self.config.handle_addr => self.handle_addr(addresses),
            Message::Inv(items) => {
                let handler = self.inventory_handler.read().clone();
                if let Some(handler) = handler {
                    handler.handle_inventory_items(peer, items);
                }
            }
            other => debug!(peer = %peer.host(), command = other.command(), "Unhandled message"),
        }
    }

    fn on_task_complete(&self, peer: &Arc<Peer>, task: Box<dyn PeerTask>) {
        let handler = self.task_handler.read().clone();
        match handler {
            Some(handler) => handler.handle_completed_task(peer, task),
            None => debug!(peer = %peer.host(), task = task.name(), "No task handler"),
        }
    }
}
