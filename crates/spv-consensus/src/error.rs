//! Error types for consensus validation.

use thiserror::Error;

/// Consensus validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Header bytes could not be parsed.
    #[error("No header: {0}")]
    NoHeader(String),

    /// Retarget ancestor is missing from the local chain.
    #[error("No checkpoint block")]
    NoCheckpointBlock,

    /// Parent (or an older ancestor) is missing from the local chain.
    #[error("No previous block")]
    NoPreviousBlock,

    /// Candidate does not link to the given previous block.
    #[error("Wrong previous header hash")]
    WrongPreviousHeader,

    /// Bits differ from the expected value.
    #[error("Not equal bits: got {got:#010x}, expected {expected:#010x}")]
    NotEqualBits { got: u32, expected: u32 },

    /// Bits differ from the value computed at a retarget height.
    #[error("Not difficulty transition equal bits: got {got:#010x}, expected {expected:#010x}")]
    NotDifficultyTransitionEqualBits { got: u32, expected: u32 },

    /// Header hash is not below its target.
    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    /// Partial merkle tree failed structural or root checks.
    #[error("Invalid merkle block: {0}")]
    InvalidMerkleBlock(String),

    /// Malformed hex input.
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
