//! Concrete peer tasks used by the sync engine.

mod get_block_hashes;
mod get_merkle_blocks;

pub use get_block_hashes::GetBlockHashesTask;
pub use get_merkle_blocks::{
    GetMerkleBlocksTask, MerkleBlockHandler, MerkleBlockRejection, SlowPeerThresholds,
};
