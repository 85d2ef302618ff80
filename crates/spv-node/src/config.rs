//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spv_consensus::params::MIN_PROTOCOL_VERSION;
use spv_consensus::Network;
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Chain to sync.
    pub chain: Network,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Connections to hold.
    #[serde(default = "default_peer_count")]
    pub peer_count: usize,
    /// `initial` or `incremental`.
    #[serde(default = "default_sync_mode")]
    pub sync_mode: String,
    /// P2P port, if not the chain default.
    #[serde(default)]
    pub port: Option<u16>,
    /// Lowest protocol version accepted from peers.
    #[serde(default = "default_min_protocol_version")]
    pub min_protocol_version: i32,
    /// Learn addresses from `addr` messages.
    #[serde(default = "default_true")]
    pub handle_addr: bool,
    /// Peer IPs tried before DNS seeds.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Hex-encoded bloom filter elements.
    #[serde(default)]
    pub watch: Vec<String>,
    /// Checkpoint with ancestors, one hex record per line, newest first.
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
}

fn default_peer_count() -> usize {
    10
}

fn default_sync_mode() -> String {
    "initial".to_string()
}

fn default_min_protocol_version() -> i32 {
    MIN_PROTOCOL_VERSION
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let chain: Network = args
            .chain
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(chain)
        };

        config.chain = chain;

        if let Some(ref data_dir) = args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(peers) = args.peers {
            config.peer_count = peers;
        }
        if let Some(ref mode) = args.sync_mode {
            config.sync_mode = mode.clone();
        }
        if args.port.is_some() {
            config.port = args.port;
        }
        if args.checkpoint_file.is_some() {
            config.checkpoint_file = args.checkpoint_file.clone();
        }
        config.seeds.extend(args.seeds.iter().cloned());
        config.watch.extend(args.watch.iter().cloned());

        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(chain: Network) -> Self {
        Self {
            chain,
            data_dir: PathBuf::from(format!(".spv-{}", chain)),
            peer_count: default_peer_count(),
            sync_mode: default_sync_mode(),
            port: None,
            min_protocol_version: default_min_protocol_version(),
            handle_addr: true,
            seeds: Vec::new(),
            watch: Vec::new(),
            checkpoint_file: None,
        }
    }
}
