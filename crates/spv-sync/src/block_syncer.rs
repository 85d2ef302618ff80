//! Block-hash queue and merkle block intake.
//!
//! Hashes learned from peers are queued with increasing sequence numbers;
//! the engine pulls batches of them for download and every merkle block that
//! comes back goes through [`BlockSyncer::handle_merkle_block`]. When the
//! wallet reports that the loaded bloom filter no longer covers it, the rest
//! of the iteration is "partial": queue entries are kept so the blocks are
//! downloaded again once the gap is filled and the filter regenerated.

use crate::bloom_filter::BloomFilterManager;
use crate::listeners::BlockSyncListener;
use crate::wallet::{PublicKeyManager, TransactionProcessor};
use crate::{Blockchain, SyncError, SyncResult};
use spv_consensus::{Block, BlockHash, Checkpoint, Hash256, MerkleBlock};
use spv_network::ListenerRegistry;
use spv_storage::Storage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Blocks above the checkpoint offered as locator hashes when no header
/// sync has happened yet.
const LOCATOR_BLOCKS: usize = 10;

pub struct BlockSyncer {
    storage: Arc<dyn Storage>,
    blockchain: Arc<Blockchain>,
    transaction_processor: Arc<dyn TransactionProcessor>,
    public_key_manager: Arc<dyn PublicKeyManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    checkpoint: Block,
    checkpoint_hashes: Vec<Hash256>,
    listeners: Arc<ListenerRegistry<dyn BlockSyncListener>>,
    iteration_has_partial_blocks: AtomicBool,
}

impl BlockSyncer {
    /// Create the syncer, writing the checkpoint block and its stored
    /// ancestors into empty storage.
    pub fn new(
        storage: Arc<dyn Storage>,
        blockchain: Arc<Blockchain>,
        transaction_processor: Arc<dyn TransactionProcessor>,
        public_key_manager: Arc<dyn PublicKeyManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        checkpoint: &Checkpoint,
        listeners: Arc<ListenerRegistry<dyn BlockSyncListener>>,
    ) -> SyncResult<Self> {
        let checkpoint_blocks = checkpoint.blocks();
        let checkpoint_hashes = checkpoint_blocks.iter().map(|b| b.hash).collect();
        let checkpoint = checkpoint.block();
        if storage.last_block()?.is_none() {
            info!(
                height = checkpoint.height,
                hash = %checkpoint.hash,
                ancestors = checkpoint_blocks.len() - 1,
                "Writing checkpoint block"
            );
            for block in &checkpoint_blocks {
                storage.add_block(block)?;
            }
        }

        let syncer = Self {
            storage,
            blockchain,
            transaction_processor,
            public_key_manager,
            bloom_filter_manager,
            checkpoint,
            checkpoint_hashes,
            listeners,
            iteration_has_partial_blocks: AtomicBool::new(false),
        };
        let height = syncer.local_downloaded_best_block_height()?;
        syncer
            .listeners
            .notify(|l| l.on_initial_best_block_height_update(height));
        Ok(syncer)
    }

    pub fn checkpoint(&self) -> &Block {
        &self.checkpoint
    }

    /// Height of the last stored block.
    pub fn local_downloaded_best_block_height(&self) -> SyncResult<u32> {
        Ok(self.storage.last_block()?.map(|b| b.height).unwrap_or(0))
    }

    /// Downloaded height plus the queued hashes not yet stored as blocks.
    pub fn local_known_best_block_height(&self) -> SyncResult<u32> {
        let queued: Vec<Hash256> = self
            .storage
            .blockchain_block_hashes()?
            .into_iter()
            .map(|h| h.header_hash)
            .collect();
        let stored = self.storage.blocks_count(&queued)?;
        let pending = queued.len().saturating_sub(stored) as u32;
        Ok(self.local_downloaded_best_block_height()? + pending)
    }

    /// Reset state left over from an interrupted download.
    pub fn prepare_for_download(&self) -> SyncResult<()> {
        self.handle_partial_blocks()?;
        self.clear_partial_blocks()?;
        self.storage.delete_blockchain_block_hashes()?;
        self.blockchain.handle_fork()
    }

    pub fn download_iteration_completed(&self) -> SyncResult<()> {
        if self.iteration_has_partial_blocks.load(Ordering::SeqCst) {
            self.handle_partial_blocks()?;
        }
        Ok(())
    }

    pub fn download_completed(&self) -> SyncResult<()> {
        self.blockchain.handle_fork()
    }

    pub fn download_failed(&self) -> SyncResult<()> {
        self.prepare_for_download()
    }

    /// Next hashes to download, lowest sequence first.
    pub fn get_block_hashes(&self, limit: usize) -> SyncResult<Vec<BlockHash>> {
        Ok(self.storage.block_hashes_sorted(limit)?)
    }

    /// Locator for `getblocks`, newest first.
    ///
    /// Starts from the last hash learned from header sync, or from the
    /// newest blocks above the checkpoint. Ends with the block at the peer's
    /// announced height when we have it, the checkpoint otherwise.
    pub fn get_block_locator_hashes(&self, peer_height: u32) -> SyncResult<Vec<Hash256>> {
        let mut locator: Vec<Hash256> = match self.storage.last_blockchain_block_hash()? {
            Some(last) => vec![last.header_hash],
            None => self
                .storage
                .blocks_above(self.checkpoint.height, LOCATOR_BLOCKS)?
                .into_iter()
                .map(|b| b.hash)
                .collect(),
        };

        match self.storage.block_by_height(peer_height)? {
            Some(block) => {
                if !locator.contains(&block.hash) {
                    locator.push(block.hash);
                }
            }
            None => locator.push(self.checkpoint.hash),
        }
        Ok(locator)
    }

    /// Queue hashes from header sync, skipping ones already queued.
    pub fn add_block_hashes(&self, hashes: &[Hash256]) -> SyncResult<()> {
        let existing = self.storage.block_hash_header_hashes(&[])?;
        let mut sequence = self
            .storage
            .last_block_hash()?
            .map(|h| h.sequence)
            .unwrap_or(0);

        let mut new_hashes = Vec::new();
        for hash in hashes {
            if existing.contains(hash) || new_hashes.iter().any(|h: &BlockHash| h.header_hash == *hash) {
                continue;
            }
            sequence += 1;
            new_hashes.push(BlockHash::new(*hash, 0, sequence));
        }

        if !new_hashes.is_empty() {
            debug!(count = new_hashes.len(), "Queued block hashes");
            self.storage.add_block_hashes(&new_hashes)?;
        }
        Ok(())
    }

    /// Store a downloaded merkle block and hand its transactions to the wallet.
    ///
    /// An invalid block is also dropped from the hash queue. A block that
    /// does not connect yet stays queued.
    pub fn handle_merkle_block(&self, merkle_block: &MerkleBlock, max_block_height: u32) -> SyncResult<()> {
        let connected = match merkle_block.height {
            Some(height) => self.blockchain.force_add(merkle_block, height),
            None => self.blockchain.connect(merkle_block),
        };
        let block = match connected {
            Ok(block) => block,
            Err(e) if e.is_validation() => {
                self.storage.delete_block_hash(&merkle_block.block_hash)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let partial = self.iteration_has_partial_blocks.load(Ordering::SeqCst);
        match self.transaction_processor.process_received(
            &merkle_block.associated_transactions,
            &block,
            partial,
        ) {
            Ok(()) => {}
            Err(SyncError::BloomFilterExpired) => {
                debug!(height = block.height, "Bloom filter expired, iteration is partial");
                self.iteration_has_partial_blocks.store(true, Ordering::SeqCst);
            }
            Err(e) => return Err(e),
        }

        if !self.iteration_has_partial_blocks.load(Ordering::SeqCst) {
            self.storage.delete_block_hash(&block.hash)?;
        }

        self.listeners
            .notify(|l| l.on_current_best_block_height_update(block.height, max_block_height));
        Ok(())
    }

    /// Whether a block hash still needs downloading.
    pub fn should_request(&self, hash: &Hash256) -> SyncResult<bool> {
        Ok(self.storage.block(hash)?.is_none())
    }

    pub fn has_partial_blocks(&self) -> bool {
        self.iteration_has_partial_blocks.load(Ordering::SeqCst)
    }

    fn handle_partial_blocks(&self) -> SyncResult<()> {
        self.public_key_manager.fill_gap()?;
        self.bloom_filter_manager.regenerate();
        self.iteration_has_partial_blocks.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn clear_partial_blocks(&self) -> SyncResult<()> {
        let queued = self
            .storage
            .block_hash_header_hashes(&self.checkpoint_hashes)?;
        let blocks = self.storage.blocks_by_hashes(&queued)?;
        self.blockchain.delete_blocks(&blocks)
    }
}
