//! Sync error types.

use spv_consensus::ConsensusError;
use spv_network::tasks::MerkleBlockRejection;
use spv_network::{NetworkError, PeerError};
use spv_storage::StorageError;
use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Consensus error.
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Parent of a candidate block is not stored.
    #[error("No previous block")]
    NoPreviousBlock,

    /// The loaded bloom filter no longer covers the wallet.
    #[error("Bloom filter expired")]
    BloomFilterExpired,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// A missing parent or ancestor. The block may connect once more of the
    /// chain has been downloaded.
    pub fn is_chain_invariant(&self) -> bool {
        matches!(
            self,
            SyncError::NoPreviousBlock
                | SyncError::Consensus(ConsensusError::NoPreviousBlock | ConsensusError::NoCheckpointBlock)
        )
    }

    /// The block itself is invalid.
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Consensus(_)) && !self.is_chain_invariant()
    }
}

impl From<SyncError> for PeerError {
    fn from(e: SyncError) -> Self {
        PeerError::TaskFailed(e.to_string())
    }
}

impl From<SyncError> for MerkleBlockRejection {
    fn from(e: SyncError) -> Self {
        if e.is_chain_invariant() {
            MerkleBlockRejection::Unconnected(e.to_string())
        } else if e.is_validation() {
            MerkleBlockRejection::Invalid(e.to_string())
        } else {
            MerkleBlockRejection::Fatal(e.into())
        }
    }
}
