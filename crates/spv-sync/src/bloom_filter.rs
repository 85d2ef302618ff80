//! Bloom filter lifecycle.
//!
//! [`BloomFilterManager`] rebuilds the filter from the wallet's elements;
//! [`BloomFilterLoader`] pushes it to peers when it changes and whenever a
//! peer connects.

use crate::wallet::BloomElementsProvider;
use parking_lot::RwLock;
use spv_network::bloom::DEFAULT_FALSE_POSITIVE_RATE;
use spv_network::{BloomFilter, ListenerRegistry, Peer, PeerGroupListener, PeerManager};
use std::sync::Arc;
use tracing::{debug, info};

/// Notified when the filter changes.
pub trait BloomFilterListener: Send + Sync {
    fn on_filter_updated(&self, filter: &BloomFilter);
}

/// Owns the current filter.
pub struct BloomFilterManager {
    elements: Arc<dyn BloomElementsProvider>,
    filter: RwLock<Option<BloomFilter>>,
    listeners: ListenerRegistry<dyn BloomFilterListener>,
    tweak: u32,
}

impl BloomFilterManager {
    /// Create the manager and build the first filter.
    pub fn new(elements: Arc<dyn BloomElementsProvider>) -> Self {
        let manager = Self {
            elements,
            filter: RwLock::new(None),
            listeners: ListenerRegistry::new(),
            tweak: rand::random(),
        };
        manager.regenerate();
        manager
    }

    pub fn add_listener(&self, listener: Arc<dyn BloomFilterListener>) {
        self.listeners.add(listener);
    }

    /// The filter peers should have, if there is anything to watch.
    pub fn bloom_filter(&self) -> Option<BloomFilter> {
        self.filter.read().clone()
    }

    /// Rebuild from the current elements; listeners hear about changes only.
    pub fn regenerate(&self) {
        let elements = self.elements.elements();
        if elements.is_empty() {
            debug!("No bloom filter elements");
            return;
        }

        let filter = BloomFilter::new(&elements, DEFAULT_FALSE_POSITIVE_RATE, self.tweak);
        {
            let mut current = self.filter.write();
            if current.as_ref() == Some(&filter) {
                return;
            }
            *current = Some(filter.clone());
        }

        info!(elements = elements.len(), "Bloom filter updated");
        self.listeners.notify(|l| l.on_filter_updated(&filter));
    }
}

/// Sends `filterload` to peers.
pub struct BloomFilterLoader {
    manager: Arc<BloomFilterManager>,
    peer_manager: Arc<PeerManager>,
}

impl BloomFilterLoader {
    pub fn new(manager: Arc<BloomFilterManager>, peer_manager: Arc<PeerManager>) -> Self {
        Self {
            manager,
            peer_manager,
        }
    }
}

impl PeerGroupListener for BloomFilterLoader {
    fn on_peer_connect(&self, peer: &Arc<Peer>) {
        if let Some(filter) = self.manager.bloom_filter() {
            debug!(peer = %peer.host(), "Loading bloom filter");
            peer.filter_load(&filter);
        }
    }
}

impl BloomFilterListener for BloomFilterLoader {
    fn on_filter_updated(&self, filter: &BloomFilter) {
        for peer in self.peer_manager.connected() {
            peer.filter_load(filter);
        }
    }
}
