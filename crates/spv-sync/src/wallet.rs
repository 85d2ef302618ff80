//! Wallet collaborators.
//!
//! Key derivation, address encoding and transaction building live outside
//! this crate. The sync core only needs somewhere to put matched
//! transactions, a way to extend the key gap, and the bloom filter elements.

use crate::listeners::BlockchainDataListener;
use crate::{SyncError, SyncResult};
use spv_consensus::{Block, Hash256, Transaction};
use spv_network::ListenerRegistry;
use spv_storage::Storage;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Consumes transactions matched by the bloom filter.
pub trait TransactionProcessor: Send + Sync {
    /// Handle transactions found in `block`.
    ///
    /// Returns [`SyncError::BloomFilterExpired`] when the transactions show
    /// that the loaded filter no longer covers the wallet. With
    /// `skip_check` set that check is skipped.
    fn process_received(
        &self,
        transactions: &[Transaction],
        block: &Block,
        skip_check: bool,
    ) -> SyncResult<()>;
}

/// Derives more keys when used ones approach the gap limit.
pub trait PublicKeyManager: Send + Sync {
    fn fill_gap(&self) -> SyncResult<()>;
}

/// Supplies bloom filter elements.
pub trait BloomElementsProvider: Send + Sync {
    fn elements(&self) -> Vec<Vec<u8>>;
}

/// Stores matched transactions and flags their block.
pub struct StoringTransactionProcessor {
    storage: Arc<dyn Storage>,
    data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>>,
}

impl StoringTransactionProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>>,
    ) -> Self {
        Self {
            storage,
            data_listeners,
        }
    }
}

impl TransactionProcessor for StoringTransactionProcessor {
    fn process_received(
        &self,
        transactions: &[Transaction],
        block: &Block,
        _skip_check: bool,
    ) -> SyncResult<()> {
        if transactions.is_empty() {
            return Ok(());
        }

        let known: HashSet<Hash256> = self
            .storage
            .block_transactions(&block.hash)?
            .into_iter()
            .map(|t| t.hash)
            .collect();
        let (updated, inserted): (Vec<Transaction>, Vec<Transaction>) = transactions
            .iter()
            .cloned()
            .partition(|t| known.contains(&t.hash));

        self.storage.add_transactions(&block.hash, transactions)?;

        let mut block = block.clone();
        if !block.has_transactions {
            block.has_transactions = true;
            self.storage.update_block(&block)?;
        }

        debug!(
            block = %block.hash,
            inserted = inserted.len(),
            updated = updated.len(),
            "Stored matched transactions"
        );
        if !inserted.is_empty() {
            self.data_listeners
                .notify(|l| l.on_transactions_insert(&inserted, &block));
        }
        if !updated.is_empty() {
            self.data_listeners
                .notify(|l| l.on_transactions_update(&updated, &block));
        }
        Ok(())
    }
}

/// A fixed watch list.
#[derive(Debug, Clone, Default)]
pub struct StaticElements(pub Vec<Vec<u8>>);

impl StaticElements {
    /// Parse hex-encoded elements.
    pub fn from_hex<S: AsRef<str>>(elements: &[S]) -> SyncResult<Self> {
        elements
            .iter()
            .map(|e| {
                hex::decode(e.as_ref()).map_err(|err| {
                    SyncError::Internal(format!("watch element {}: {}", e.as_ref(), err))
                })
            })
            .collect::<SyncResult<Vec<_>>>()
            .map(Self)
    }
}

impl BloomElementsProvider for StaticElements {
    fn elements(&self) -> Vec<Vec<u8>> {
        self.0.clone()
    }
}

/// Gap filler for wallets without key derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGapFill;

impl PublicKeyManager for NoGapFill {
    fn fill_gap(&self) -> SyncResult<()> {
        Ok(())
    }
}
