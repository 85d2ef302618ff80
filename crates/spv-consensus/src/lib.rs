//! # spv-consensus
//!
//! Consensus-lite rules for an SPV client of Bitcoin-family chains.
//!
//! This crate provides:
//! - Block, header, transaction and merkle-block models
//! - Compact ("nBits") target encoding
//! - Proof-of-work and difficulty validators (legacy retarget, EDA, DAA, DGW)
//! - Partial merkle tree extraction for `merkleblock` messages
//! - Per-network chain parameters and checkpoints
//!
//! ## Validator chain
//!
//! ```text
//! candidate ──> linkage ──> proof of work ──> first applicable difficulty rule
//!                                              (DAA | legacy | EDA | bits | DGW)
//! ```
//!
//! Full script and UTXO validation is out of scope.

pub mod bitcoin_cash;
pub mod block;
mod chain_params;
mod compact;
pub mod dash;
pub mod difficulty;
mod error;
mod hash;
pub mod merkle;
pub mod validation;

pub use block::{Block, BlockHash, BlockHeader, MerkleBlock, Transaction, HEADER_SIZE};
pub use chain_params::{ChainParams, Checkpoint, Network, ValidatorKind};
pub use compact::{decode_compact, encode_compact, hash_to_biguint, largest_hash};
pub use error::{ConsensusError, ConsensusResult};
pub use hash::{sha256d, Hash256};
pub use merkle::{MerkleBlockExtractor, MerkleBlockMessage};
pub use validation::{
    check_proof_of_work, BlockLookup, BlockValidator, BlockValidatorChain, ProofOfWorkValidator,
};

/// Peer-to-peer protocol constants.
pub mod params {
    /// Protocol version we announce.
    pub const PROTOCOL_VERSION: i32 = 70014;

    /// Lowest peer protocol version accepted by default.
    pub const MIN_PROTOCOL_VERSION: i32 = 70011;

    /// First protocol version with BIP37 bloom filters.
    pub const BLOOM_FILTER_VERSION: i32 = 70000;

    /// From this version peers must advertise `NODE_BLOOM` explicitly.
    pub const NO_BLOOM_VERSION: i32 = 70011;

    /// Version message carries from-address, nonce, user agent and height.
    pub const VERSION_WITH_ADDR_FROM: i32 = 106;

    /// Version message carries the relay flag.
    pub const VERSION_WITH_RELAY: i32 = 70001;

    /// `NODE_NETWORK` service bit.
    pub const SERVICE_FULL_NODE: u64 = 1;

    /// `NODE_BLOOM` service bit.
    pub const SERVICE_BLOOM_FILTER: u64 = 4;

    /// Maximum locator/inventory entries in a single `getblocks` response.
    pub const MAX_BLOCKS_PER_INV: usize = 500;

    /// User agent announced in `version`.
    pub const USER_AGENT: &str = "/spv-sync:0.1.0/";
}
