//! Scored peer address pool.

use crate::PeerDiscovery;
use parking_lot::Mutex;
use spv_storage::{PeerAddress, Storage, StorageResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Hands out addresses for new connections and scores them afterwards.
///
/// Addresses in use are excluded from selection until the peer
/// disconnects. When no candidate remains a DNS lookup is started in the
/// background and the caller gets `None` for this round.
pub struct PeerAddressManager {
    storage: Arc<dyn Storage>,
    discovery: PeerDiscovery,
    used: Mutex<HashSet<String>>,
    discovering: AtomicBool,
    added: Arc<Notify>,
}

impl PeerAddressManager {
    pub fn new(storage: Arc<dyn Storage>, discovery: PeerDiscovery) -> Arc<Self> {
        Arc::new(Self {
            storage,
            discovery,
            used: Mutex::new(HashSet::new()),
            discovering: AtomicBool::new(false),
            added: Arc::new(Notify::new()),
        })
    }

    /// Signalled whenever new addresses are stored.
    pub fn added(&self) -> Arc<Notify> {
        self.added.clone()
    }

    fn used(&self) -> Vec<String> {
        self.used.lock().iter().cloned().collect()
    }

    fn best_candidate(&self) -> StorageResult<Option<PeerAddress>> {
        self.storage.least_score_fastest_peer_address(&self.used())
    }

    /// Whether the best candidate has never been connected.
    pub fn has_fresh_ips(&self) -> StorageResult<bool> {
        Ok(self
            .best_candidate()?
            .map(|address| address.connection_time.is_none())
            .unwrap_or(false))
    }

    /// Reserve the best unused address.
    ///
    /// Selection and reservation happen under one lock, so concurrent
    /// callers never receive the same address.
    pub fn get_ip(self: &Arc<Self>) -> StorageResult<Option<String>> {
        let reserved = {
            let mut used = self.used.lock();
            let excluded: Vec<String> = used.iter().cloned().collect();
            let candidate = self.storage.least_score_fastest_peer_address(&excluded)?;
            candidate.map(|address| {
                used.insert(address.ip.clone());
                address.ip
            })
        };

        if reserved.is_none() {
            self.start_discovery();
        }
        Ok(reserved)
    }

    fn start_discovery(self: &Arc<Self>) {
        if self.discovering.swap(true, Ordering::SeqCst) {
            debug!("DNS lookup already running");
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let ips = manager.discovery.lookup().await;
            if ips.is_empty() {
                warn!("DNS seeds returned no addresses");
            } else if let Err(e) = manager.add_ips(&ips) {
                warn!(error = %e, "Failed to store discovered addresses");
            }
            manager.discovering.store(false, Ordering::SeqCst);
        });
    }

    /// Store new addresses with score 0; known ones are left alone.
    pub fn add_ips(&self, ips: &[String]) -> StorageResult<()> {
        let addresses: Vec<PeerAddress> = ips.iter().map(PeerAddress::new).collect();
        self.storage.set_peer_addresses(&addresses)?;
        info!(count = ips.len(), "Added new addresses");
        self.added.notify_one();
        Ok(())
    }

    /// Record the connect latency of a peer.
    pub fn mark_connected(&self, ip: &str, connection_time: Duration) -> StorageResult<()> {
        self.storage
            .mark_peer_connected(ip, connection_time.as_millis() as u64)
    }

    /// Release an address that worked. Its score goes up so other
    /// addresses get their turn.
    pub fn mark_success(&self, ip: &str) -> StorageResult<()> {
        self.used.lock().remove(ip);
        self.storage.increase_peer_score(ip, 1)
    }

    /// Forget an address that failed.
    pub fn mark_failed(&self, ip: &str) -> StorageResult<()> {
        self.used.lock().remove(ip);
        self.storage.delete_peer_address(ip)
    }

    /// Number of addresses currently reserved.
    pub fn used_count(&self) -> usize {
        self.used.lock().len()
    }
}
