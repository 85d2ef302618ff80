//! Callback surfaces produced by the sync layer.
//!
//! All methods default to no-ops so implementors pick what they need.
//! Delivery goes through [`ListenerRegistry`](spv_network::ListenerRegistry),
//! which isolates panicking listeners.

use spv_consensus::{Block, Hash256, Transaction};
use spv_network::Peer;
use std::sync::Arc;

/// Block download progress.
pub trait BlockSyncListener: Send + Sync {
    /// A sync peer was assigned.
    fn on_sync_start(&self) {}

    /// The engine stopped, with the error that caused it if any.
    fn on_sync_stop(&self, _error: Option<&str>) {}

    /// Height the download starts from.
    fn on_initial_best_block_height_update(&self, _height: u32) {}

    /// A block at `height` was stored while syncing towards `max_block_height`.
    fn on_current_best_block_height_update(&self, _height: u32, _max_block_height: u32) {}

    /// Local chain caught up with the sync peer.
    fn on_block_sync_finished(&self) {}
}

/// Per-peer sync completion.
pub trait PeerSyncListener: Send + Sync {
    fn on_peer_synced(&self, _peer: &Arc<Peer>) {}
    fn on_all_peers_synced(&self) {}
}

/// Chain mutations, for the wallet data layer.
pub trait BlockchainDataListener: Send + Sync {
    fn on_block_insert(&self, _block: &Block) {}
    fn on_transactions_insert(&self, _transactions: &[Transaction], _block: &Block) {}
    fn on_transactions_update(&self, _transactions: &[Transaction], _block: &Block) {}
    fn on_transactions_delete(&self, _hashes: &[Hash256]) {}
}
