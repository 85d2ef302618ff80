//! # spv-storage
//!
//! Storage collaborator for the SPV sync core.
//!
//! The sync engine only depends on the [`Storage`] trait. This crate ships
//! one implementation, [`MemoryStorage`], which keeps everything in memory
//! and can persist a JSON snapshot between sessions.
//!
//! ## Record kinds
//!
//! - Blocks, keyed by header hash, with `stale` and `has_transactions` flags
//! - Matched wallet transactions, grouped by block hash
//! - The block-hash download queue, ordered by sequence number
//! - Scored peer addresses

mod error;
mod memory;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;

use serde::{Deserialize, Serialize};
use spv_consensus::{Block, BlockHash, Hash256, Transaction};

/// A known peer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// IP address (no port).
    pub ip: String,
    /// Usage score; lower is preferred.
    pub score: i32,
    /// Last measured connection time in milliseconds.
    pub connection_time: Option<u64>,
}

impl PeerAddress {
    /// A never-connected address with score 0.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            score: 0,
            connection_time: None,
        }
    }
}

/// Query surface required by the sync core.
///
/// Every call is atomic. Sequences of calls that must not interleave are
/// serialized by the caller.
pub trait Storage: Send + Sync {
    // Blocks

    /// Block by header hash.
    fn block(&self, hash: &Hash256) -> StorageResult<Option<Block>>;

    /// Block at `height`, preferring the non-stale one.
    fn block_by_height(&self, height: u32) -> StorageResult<Option<Block>>;

    /// Highest stored block.
    fn last_block(&self) -> StorageResult<Option<Block>>;

    /// How many of `hashes` are stored as blocks.
    fn blocks_count(&self, hashes: &[Hash256]) -> StorageResult<usize>;

    /// Lowest block with the given stale flag.
    fn lowest_block(&self, stale: bool) -> StorageResult<Option<Block>>;

    /// Highest block with the given stale flag.
    fn highest_block(&self, stale: bool) -> StorageResult<Option<Block>>;

    /// All blocks with the given stale flag.
    fn blocks_by_stale(&self, stale: bool) -> StorageResult<Vec<Block>>;

    /// Blocks at or above `height` with the given stale flag.
    fn blocks_from_height(&self, height: u32, stale: bool) -> StorageResult<Vec<Block>>;

    /// Up to `limit` blocks strictly above `height`, highest first.
    fn blocks_above(&self, height: u32, limit: usize) -> StorageResult<Vec<Block>>;

    /// Stored blocks among `hashes`.
    fn blocks_by_hashes(&self, hashes: &[Hash256]) -> StorageResult<Vec<Block>>;

    /// Insert a block (replacing any with the same hash).
    fn add_block(&self, block: &Block) -> StorageResult<()>;

    /// Update an existing block's flags.
    fn update_block(&self, block: &Block) -> StorageResult<()>;

    /// Clear every `stale` flag.
    fn unstale_all_blocks(&self) -> StorageResult<()>;

    /// Delete blocks together with their transactions.
    fn delete_blocks(&self, blocks: &[Block]) -> StorageResult<()>;

    /// Delete blocks below `height` that carry no transactions.
    fn delete_blocks_without_transactions(&self, below_height: u32) -> StorageResult<usize>;

    // Transactions

    /// Transactions stored for a block.
    fn block_transactions(&self, block_hash: &Hash256) -> StorageResult<Vec<Transaction>>;

    /// Store transactions matched in a block.
    fn add_transactions(&self, block_hash: &Hash256, transactions: &[Transaction]) -> StorageResult<()>;

    // Block-hash queue

    /// Entry with the highest sequence.
    fn last_block_hash(&self) -> StorageResult<Option<BlockHash>>;

    /// Entry with the highest sequence among locator-sourced (height 0) entries.
    fn last_blockchain_block_hash(&self) -> StorageResult<Option<BlockHash>>;

    /// All locator-sourced (height 0) entries, by sequence.
    fn blockchain_block_hashes(&self) -> StorageResult<Vec<BlockHash>>;

    /// Header hashes of all queued entries except `except`.
    fn block_hash_header_hashes(&self, except: &[Hash256]) -> StorageResult<Vec<Hash256>>;

    /// Up to `limit` entries by ascending sequence.
    fn block_hashes_sorted(&self, limit: usize) -> StorageResult<Vec<BlockHash>>;

    /// Whether a hash is queued.
    fn block_hash_exists(&self, hash: &Hash256) -> StorageResult<bool>;

    /// Queue entries (existing hashes are overwritten).
    fn add_block_hashes(&self, hashes: &[BlockHash]) -> StorageResult<()>;

    /// Remove one entry.
    fn delete_block_hash(&self, hash: &Hash256) -> StorageResult<()>;

    /// Remove every locator-sourced (height 0) entry.
    fn delete_blockchain_block_hashes(&self) -> StorageResult<()>;

    // Peer addresses

    /// Best address not in `exclude`: lowest score, then never connected,
    /// then fastest connection.
    fn least_score_fastest_peer_address(&self, exclude: &[String]) -> StorageResult<Option<PeerAddress>>;

    /// Insert addresses, ignoring known ones.
    fn set_peer_addresses(&self, addresses: &[PeerAddress]) -> StorageResult<()>;

    /// Forget an address.
    fn delete_peer_address(&self, ip: &str) -> StorageResult<()>;

    /// Record a connection time in milliseconds.
    fn mark_peer_connected(&self, ip: &str, connection_time: u64) -> StorageResult<()>;

    /// Raise an address score by `by`.
    fn increase_peer_score(&self, ip: &str, by: i32) -> StorageResult<()>;

    /// Number of known addresses.
    fn peer_addresses_count(&self) -> StorageResult<usize>;
}
