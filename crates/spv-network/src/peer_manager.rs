//! Registry of live peers.

use crate::Peer;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent map of peers keyed by host.
///
/// Every query returns a snapshot; callers never iterate the live map.
#[derive(Default)]
pub struct PeerManager {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.host().to_string(), peer);
    }

    pub fn remove(&self, host: &str) -> Option<Arc<Peer>> {
        self.peers.remove(host).map(|(_, peer)| peer)
    }

    pub fn get(&self, host: &str) -> Option<Arc<Peer>> {
        self.peers.get(host).map(|entry| entry.value().clone())
    }

    /// Registered peers, connected or not.
    pub fn peers_count(&self) -> usize {
        self.peers.len()
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn connected(&self) -> Vec<Arc<Peer>> {
        self.all().into_iter().filter(|p| p.is_connected()).collect()
    }

    /// Connected peers, fastest connection first.
    pub fn sorted(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.connected();
        peers.sort_by_key(|p| p.connection_time().unwrap_or(std::time::Duration::MAX));
        peers
    }

    /// Half of the ready peers (at least one), so a burst of work does not
    /// occupy the whole pool.
    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        let ready: Vec<Arc<Peer>> = self.all().into_iter().filter(|p| p.ready()).collect();
        let take = (ready.len() / 2).max(1);
        ready.into_iter().take(take).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected().len()
    }

    pub fn synced_count(&self) -> usize {
        self.connected().iter().filter(|p| p.synced()).count()
    }

    /// Close every peer. Each will report its own disconnect.
    pub fn disconnect_all(&self) {
        for peer in self.all() {
            peer.close(None);
        }
    }
}
