//! SPV Node - block header and merkle block sync for Bitcoin-family chains.
//!
//! This is the main entry point for the spv-node binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// SPV client that keeps a header chain and filtered blocks in sync.
#[derive(Parser, Debug)]
#[command(name = "spv-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "spv-node.toml")]
    config: PathBuf,

    /// Chain to sync (bitcoin, bitcoin-cash, regtest)
    #[arg(long, default_value = "bitcoin-cash")]
    chain: String,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Number of peers to keep connected
    #[arg(long)]
    peers: Option<usize>,

    /// Sync mode (initial, incremental)
    #[arg(long)]
    sync_mode: Option<String>,

    /// Peer IP to try before DNS seeds (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Hex-encoded bloom filter element to watch (repeatable)
    #[arg(long = "watch")]
    watch: Vec<String>,

    /// P2P port override
    #[arg(long)]
    port: Option<u16>,

    /// Checkpoint file replacing the built-in checkpoint
    #[arg(long)]
    checkpoint_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting SPV node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;

    info!("Chain: {}", config.chain);
    info!("Data directory: {:?}", config.data_dir);
    info!("Peers: {}, sync mode: {}", config.peer_count, config.sync_mode);

    let node = Node::new(config)?;

    let shutdown_signal = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {}", e);
            }
        }
        _ = shutdown_signal => {}
    }

    node.shutdown().await?;
    info!("SPV node stopped");

    Ok(())
}
