//! Chain mutation and fork resolution.
//!
//! Blocks arriving through [`Blockchain::connect`] are written as `stale`:
//! several peers may deliver competing branches and nothing is decided at
//! insert time. [`Blockchain::handle_fork`] later reconciles the stale set
//! against the main branch in one pass.

use crate::listeners::BlockchainDataListener;
use crate::{SyncError, SyncResult};
use spv_consensus::{Block, BlockLookup, BlockValidatorChain, Hash256, MerkleBlock};
use spv_network::ListenerRegistry;
use spv_storage::Storage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// [`BlockLookup`] over storage. Storage errors read as missing blocks,
/// which validators report as a missing ancestor.
struct StorageLookup<'a>(&'a dyn Storage);

impl BlockLookup for StorageLookup<'_> {
    fn lookup_block(&self, hash: &Hash256) -> Option<Block> {
        match self.0.block(hash) {
            Ok(block) => block,
            Err(e) => {
                warn!(hash = %hash, error = %e, "Block lookup failed");
                None
            }
        }
    }
}

/// The local header chain.
pub struct Blockchain {
    storage: Arc<dyn Storage>,
    validator: BlockValidatorChain,
    retarget_interval: u32,
    data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>>,
}

impl Blockchain {
    pub fn new(
        storage: Arc<dyn Storage>,
        validator: BlockValidatorChain,
        retarget_interval: u32,
        data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>>,
    ) -> Self {
        Self {
            storage,
            validator,
            retarget_interval,
            data_listeners,
        }
    }

    /// Validate and store a block on top of its parent, marked stale.
    pub fn connect(&self, merkle_block: &MerkleBlock) -> SyncResult<Block> {
        if let Some(existing) = self.storage.block(&merkle_block.block_hash)? {
            return Ok(existing);
        }

        let parent = self
            .storage
            .block(&merkle_block.header.previous_block_hash)?
            .ok_or(SyncError::NoPreviousBlock)?;

        let mut block = Block::with_parent(merkle_block.header.clone(), &parent);
        self.validator
            .validate(&block, &parent, &StorageLookup(self.storage.as_ref()))?;
        block.stale = true;

        if self.retarget_interval > 0
            && block.height >= self.retarget_interval
            && block.height % self.retarget_interval == 0
        {
            let pruned = self
                .storage
                .delete_blocks_without_transactions(block.height - self.retarget_interval)?;
            debug!(height = block.height, pruned, "Pruned old blocks");
        }

        self.add_block_and_notify(block)
    }

    /// Store a block at a known height without looking up its parent.
    pub fn force_add(&self, merkle_block: &MerkleBlock, height: u32) -> SyncResult<Block> {
        if let Some(existing) = self.storage.block(&merkle_block.block_hash)? {
            return Ok(existing);
        }
        self.add_block_and_notify(Block::new(merkle_block.header.clone(), height))
    }

    /// Reconcile stale blocks against the main branch.
    ///
    /// The stale branch replaces the main branch only when it is strictly
    /// longer. Without overlap the stale blocks simply extend the chain.
    pub fn handle_fork(&self) -> SyncResult<()> {
        let Some(first_stale) = self.storage.lowest_block(true)? else {
            return Ok(());
        };
        let last_not_stale_height = self
            .storage
            .highest_block(false)?
            .map(|b| b.height)
            .unwrap_or(0);

        if first_stale.height <= last_not_stale_height {
            let last_stale_height = self
                .storage
                .highest_block(true)?
                .map(|b| b.height)
                .unwrap_or(first_stale.height);

            if last_stale_height > last_not_stale_height {
                info!(
                    from = first_stale.height,
                    stale_tip = last_stale_height,
                    main_tip = last_not_stale_height,
                    "Reorganizing to longer branch"
                );
                let main_branch = self
                    .storage
                    .blocks_from_height(first_stale.height, false)?;
                self.delete_blocks(&main_branch)?;
                self.storage.unstale_all_blocks()?;
            } else {
                info!(
                    from = first_stale.height,
                    stale_tip = last_stale_height,
                    main_tip = last_not_stale_height,
                    "Discarding shorter branch"
                );
                let stale = self.storage.blocks_by_stale(true)?;
                self.delete_blocks(&stale)?;
            }
        } else {
            self.storage.unstale_all_blocks()?;
        }
        Ok(())
    }

    /// Delete blocks and report the transactions that went with them.
    pub fn delete_blocks(&self, blocks: &[Block]) -> SyncResult<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut deleted = Vec::new();
        for block in blocks {
            deleted.extend(
                self.storage
                    .block_transactions(&block.hash)?
                    .into_iter()
                    .map(|t| t.hash),
            );
        }

        self.storage.delete_blocks(blocks)?;
        debug!(blocks = blocks.len(), transactions = deleted.len(), "Deleted blocks");

        if !deleted.is_empty() {
            self.data_listeners
                .notify(|l| l.on_transactions_delete(&deleted));
        }
        Ok(())
    }

    fn add_block_and_notify(&self, block: Block) -> SyncResult<Block> {
        self.storage.add_block(&block)?;
        self.data_listeners.notify(|l| l.on_block_insert(&block));
        Ok(block)
    }
}
