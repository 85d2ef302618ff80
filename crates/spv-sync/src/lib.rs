//! # spv-sync
//!
//! Chain reconciliation and block download for an SPV client.
//!
//! This crate provides:
//! - The local header chain with speculative writes and fork resolution
//! - The block-hash download queue and merkle block intake
//! - A single-worker sync engine for initial and incremental download
//! - Bloom filter regeneration and loading
//! - Listener surfaces and a coarse sync state tracker

mod block_syncer;
mod blockchain;
mod bloom_filter;
mod engine;
mod error;
pub mod listeners;
mod progress;
pub mod wallet;

pub use block_syncer::BlockSyncer;
pub use blockchain::Blockchain;
pub use bloom_filter::{BloomFilterListener, BloomFilterLoader, BloomFilterManager};
pub use engine::{SyncConfig, SyncEngine, SyncStrategy};
pub use error::{SyncError, SyncResult};
pub use listeners::{BlockSyncListener, BlockchainDataListener, PeerSyncListener};
pub use progress::{SyncState, SyncStateListener, SyncStateTracker};
pub use wallet::{
    BloomElementsProvider, NoGapFill, PublicKeyManager, StaticElements,
    StoringTransactionProcessor, TransactionProcessor,
};
