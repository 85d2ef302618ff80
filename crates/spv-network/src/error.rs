//! Network error types.

use thiserror::Error;

/// Wire and transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Network magic mismatch.
    #[error("Network magic mismatch: got {0}")]
    MagicMismatch(String),

    /// Payload checksum mismatch.
    #[error("Checksum mismatch for {command}")]
    ChecksumMismatch { command: String },

    /// Command field is not printable ASCII.
    #[error("Unreadable command: {0}")]
    UnknownCommand(String),

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Why a peer was disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Transport or protocol failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Version message rejected.
    #[error("Unsuitable peer version: {0}")]
    UnsuitablePeerVersion(String),

    /// No pong within the deadline.
    #[error("Ping timeout")]
    PingTimeout,

    /// Connect or read deadline passed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A task failed for a reason of its own.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Requested merkle blocks never arrived.
    #[error("Merkle block not received")]
    MerkleBlockNotReceived,

    /// Download rate fell below the minimums.
    #[error("Peer too slow: {0}")]
    PeerTooSlow(String),

    /// Closed locally without an error.
    #[error("Closed")]
    Closed,
}

impl PeerError {
    /// Idle or ping timeouts, which do not penalize the address.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::PingTimeout | PeerError::Timeout(_))
    }
}

impl From<NetworkError> for PeerError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Timeout(reason) => PeerError::Timeout(reason),
            other => PeerError::Network(other.to_string()),
        }
    }
}
