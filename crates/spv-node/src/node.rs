//! Node implementation.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use spv_consensus::{ChainParams, Checkpoint};
use spv_network::{
    ConnectionConfig, ListenerRegistry, Peer, PeerAddressManager, PeerDiscovery, PeerError,
    PeerGroup, PeerGroupConfig, PeerGroupListener, PeerManager,
};
use spv_storage::MemoryStorage;
use spv_sync::{
    BlockSyncListener, BlockSyncer, Blockchain, BlockchainDataListener, BloomFilterLoader,
    BloomFilterManager, NoGapFill, PeerSyncListener, StaticElements, StoringTransactionProcessor,
    SyncConfig, SyncEngine, SyncState, SyncStateListener, SyncStateTracker, SyncStrategy,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the storage snapshot is written while running.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Logs pool and sync progress.
struct ProgressLogger {
    peer_manager: Arc<PeerManager>,
}

impl PeerGroupListener for ProgressLogger {
    fn on_start(&self) {
        info!("Peer group started");
    }

    fn on_stop(&self) {
        info!("Peer group stopped");
    }

    fn on_peer_connect(&self, peer: &Arc<Peer>) {
        info!(
            peer = %peer.host(),
            height = peer.announced_height(),
            connected = self.peer_manager.connected_count(),
            "Peer connected"
        );
    }

    fn on_peer_disconnect(&self, peer: &Arc<Peer>, error: Option<&PeerError>) {
        match error {
            Some(e) => debug!(peer = %peer.host(), error = %e, "Peer disconnected"),
            None => debug!(peer = %peer.host(), "Peer disconnected"),
        }
    }
}

impl SyncStateListener for ProgressLogger {
    fn on_sync_state_update(&self, state: &SyncState) {
        info!("Sync state: {}", state);
    }
}

impl PeerSyncListener for ProgressLogger {
    fn on_peer_synced(&self, peer: &Arc<Peer>) {
        info!(peer = %peer.host(), "Synced with peer");
    }

    fn on_all_peers_synced(&self) {
        info!(
            synced = self.peer_manager.synced_count(),
            "All connected peers synced"
        );
    }
}

/// The main node struct coordinating all components.
pub struct Node {
    storage: Arc<MemoryStorage>,
    peer_group: Arc<PeerGroup>,
    engine: Arc<SyncEngine>,
    tracker: Arc<SyncStateTracker>,
}

impl Node {
    /// Open storage and wire every component. Peers are not contacted
    /// until [`Node::run`].
    pub fn new(config: NodeConfig) -> Result<Self> {
        let mut params = ChainParams::for_network(config.chain)?;
        if let Some(port) = config.port {
            params = params.with_port(port);
        }
        if let Some(ref path) = config.checkpoint_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read checkpoint file {}", path.display()))?;
            let checkpoint = Checkpoint::parse(&text).context("Failed to parse checkpoint file")?;
            info!(
                height = checkpoint.height,
                ancestors = checkpoint.additional_blocks.len(),
                "Loaded checkpoint file"
            );
            params = params.with_checkpoint(checkpoint);
        }
        if params.stored_history() < params.required_history() {
            warn!(
                stored = params.stored_history(),
                required = params.required_history(),
                "Checkpoint lacks the blocks difficulty validation needs, blocks above it will not connect"
            );
        }
        let strategy: SyncStrategy = config
            .sync_mode
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        std::fs::create_dir_all(&config.data_dir)?;
        let storage_path = config.data_dir.join("storage.json");
        let storage = Arc::new(MemoryStorage::open(&storage_path).context("Failed to open storage")?);

        let data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>> =
            Arc::new(ListenerRegistry::new());
        let sync_listeners: Arc<ListenerRegistry<dyn BlockSyncListener>> =
            Arc::new(ListenerRegistry::new());

        let tracker = Arc::new(SyncStateTracker::new());
        sync_listeners.add(tracker.clone());

        let blockchain = Arc::new(Blockchain::new(
            storage.clone(),
            params.validator_chain(),
            params.retarget_interval,
            data_listeners.clone(),
        ));

        let elements = StaticElements::from_hex(&config.watch)?;
        if elements.0.is_empty() {
            warn!("No watch elements configured, peers will not get a bloom filter");
        }
        let bloom_filter_manager = Arc::new(BloomFilterManager::new(Arc::new(elements)));

        let block_syncer = Arc::new(BlockSyncer::new(
            storage.clone(),
            blockchain,
            Arc::new(StoringTransactionProcessor::new(storage.clone(), data_listeners)),
            Arc::new(NoGapFill),
            bloom_filter_manager.clone(),
            &params.checkpoint,
            sync_listeners.clone(),
        )?);
        let local_height = block_syncer.local_downloaded_best_block_height()?;
        info!(height = local_height, "Local chain loaded");

        let peer_manager = Arc::new(PeerManager::new());
        let discovery = PeerDiscovery::new(params.dns_seeds.clone(), params.default_port);
        let address_manager = PeerAddressManager::new(storage.clone(), discovery);
        if !config.seeds.is_empty() {
            address_manager.add_ips(&config.seeds)?;
        }

        let connection = ConnectionConfig {
            min_protocol_version: config.min_protocol_version,
            ..ConnectionConfig::for_chain(&params)
        };
        let group_config = PeerGroupConfig {
            peer_count: config.peer_count,
            handle_addr: config.handle_addr,
            max_block_size: params.max_block_size,
            ..PeerGroupConfig::default()
        };
        let peer_group = PeerGroup::new(group_config, connection, address_manager, peer_manager.clone());
        peer_group.set_local_best_height(local_height);

        let engine = SyncEngine::new(
            SyncConfig {
                strategy,
                ..SyncConfig::default()
            },
            block_syncer,
            peer_manager.clone(),
            sync_listeners,
        );

        let loader = Arc::new(BloomFilterLoader::new(bloom_filter_manager.clone(), peer_manager.clone()));
        bloom_filter_manager.add_listener(loader.clone());

        let logger = Arc::new(ProgressLogger { peer_manager });
        tracker.add_listener(logger.clone());
        engine.add_peer_sync_listener(logger.clone());

        // Peers must have the filter before the engine hands them work.
        peer_group.add_listener(loader);
        peer_group.add_listener(engine.clone());
        peer_group.add_listener(logger);
        peer_group.set_inventory_items_handler(engine.clone());
        peer_group.set_peer_task_handler(engine.clone());

        Ok(Self {
            storage,
            peer_group,
            engine,
            tracker,
        })
    }

    /// Start the peer pool and flush storage periodically until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(strategy = ?self.engine.strategy(), "Starting sync");
        self.peer_group.start();

        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.storage.flush()?;
            debug!(state = %self.tracker.state(), "Storage flushed");
        }
    }

    /// Disconnect every peer, let the engine drain, then flush storage.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down");
        self.peer_group.stop();
        self.engine.barrier().await;
        self.engine.shutdown();
        self.storage.flush()?;
        info!(state = %self.tracker.state(), "Storage flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv_consensus::Network;
    use spv_storage::Storage;

    #[tokio::test]
    async fn test_node_writes_checkpoint_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            watch: vec!["00ff".into()],
            ..NodeConfig::default_for_network(Network::Regtest)
        };

        let node = Node::new(config.clone()).unwrap();
        node.shutdown().await.unwrap();
        drop(node);

        let storage = MemoryStorage::open(dir.path().join("storage.json")).unwrap();
        let params = ChainParams::regtest().unwrap();
        assert_eq!(storage.last_block().unwrap().unwrap().hash, params.checkpoint.hash());
    }

    fn solve(mut header: spv_consensus::BlockHeader) -> spv_consensus::BlockHeader {
        while spv_consensus::check_proof_of_work(&header.hash(), header.bits).is_err() {
            header.nonce += 1;
        }
        header
    }

    fn record(header: &spv_consensus::BlockHeader, height: i32) -> String {
        let mut bytes = header.serialize().to_vec();
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.extend_from_slice(header.hash().as_bytes());
        hex::encode(bytes)
    }

    #[tokio::test]
    async fn test_node_starts_from_checkpoint_file() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = ChainParams::regtest().unwrap().checkpoint.header;
        let child = solve(spv_consensus::BlockHeader {
            previous_block_hash: genesis.hash(),
            timestamp: genesis.timestamp + 600,
            nonce: 0,
            ..genesis.clone()
        });
        let path = dir.path().join("checkpoint.txt");
        std::fs::write(&path, format!("{}\n{}\n", record(&child, 1), record(&genesis, 0))).unwrap();

        let config = NodeConfig {
            data_dir: dir.path().join("data"),
            watch: vec!["00ff".into()],
            checkpoint_file: Some(path),
            ..NodeConfig::default_for_network(Network::Regtest)
        };
        let node = Node::new(config).unwrap();
        node.shutdown().await.unwrap();
        drop(node);

        let storage = MemoryStorage::open(dir.path().join("data").join("storage.json")).unwrap();
        let tip = storage.last_block().unwrap().unwrap();
        assert_eq!(tip.hash, child.hash());
        assert_eq!(tip.height, 1);
        assert!(storage.block(&genesis.hash()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bad_checkpoint_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.txt");
        std::fs::write(&path, "zz\n").unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            checkpoint_file: Some(path),
            ..NodeConfig::default_for_network(Network::Regtest)
        };
        assert!(Node::new(config).is_err());
    }

    #[tokio::test]
    async fn test_bad_watch_element_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            watch: vec!["not-hex".into()],
            ..NodeConfig::default_for_network(Network::Regtest)
        };
        assert!(Node::new(config).is_err());
    }
}
