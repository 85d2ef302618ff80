//! # spv-network
//!
//! P2P networking layer for an SPV client of Bitcoin-family chains.
//!
//! This crate provides:
//! - The wire envelope codec and the message set
//! - BIP37 bloom filters
//! - Per-peer connection workers with handshake, keepalive and task queue
//! - Block-hash and merkle-block fetch tasks
//! - Scored address pool with DNS seed fallback
//! - The connection pool daemon

mod address_manager;
pub mod bloom;
pub mod codec;
pub mod connection;
mod discovery;
mod error;
pub mod listeners;
pub mod message;
mod peer;
mod peer_group;
mod peer_manager;
pub mod task;
pub mod tasks;
mod timer;

pub use address_manager::PeerAddressManager;
pub use bloom::BloomFilter;
pub use codec::MessageCodec;
pub use connection::{ConnectionConfig, PeerConnection};
pub use discovery::PeerDiscovery;
pub use error::{NetworkError, NetworkResult, PeerError};
pub use listeners::ListenerRegistry;
pub use message::{InventoryItem, InventoryType, Message, VersionMessage};
pub use peer::{Peer, PeerListener, PeerStatus};
pub use peer_group::{
    InventoryItemsHandler, PeerGroup, PeerGroupConfig, PeerGroupListener, PeerTaskHandler,
};
pub use peer_manager::PeerManager;
pub use task::{PeerTask, TaskContext, TaskMessage, TaskOutcome};
pub use timer::{PeerTimer, TimerEvent};
