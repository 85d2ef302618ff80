//! Test harness for integration tests.
//!
//! Provides snapshot-backed storage in a temporary directory, a wired
//! blockchain/block syncer pair, and [`FakePeer`]: a scripted remote node
//! that speaks the wire protocol over a real TCP socket and serves a mined
//! chain.

use crate::generators::{regtest_params, MinedBlock};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use spv_consensus::params::{PROTOCOL_VERSION, SERVICE_BLOOM_FILTER, SERVICE_FULL_NODE};
use spv_consensus::{BlockHeader, ChainParams, Hash256};
use spv_network::message::NetworkAddress;
use spv_network::{
    ConnectionConfig, InventoryItem, InventoryType, ListenerRegistry, Message, MessageCodec,
    PeerAddressManager, PeerDiscovery, PeerGroup, PeerGroupConfig, PeerManager, VersionMessage,
};
use spv_storage::MemoryStorage;
use spv_sync::{
    BlockSyncListener, BlockSyncer, Blockchain, BlockchainDataListener, BloomFilterLoader,
    BloomFilterManager, NoGapFill, StaticElements, StoringTransactionProcessor, SyncConfig,
    SyncEngine, SyncStrategy,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// Snapshot-backed storage that cleans up on drop.
pub struct TestStorage {
    storage: Arc<MemoryStorage>,
    _temp_dir: TempDir,
}

impl TestStorage {
    /// Create storage in a new temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let storage = MemoryStorage::open(temp_dir.path().join("storage.json"))
            .expect("Failed to open storage");
        Self {
            storage: Arc::new(storage),
            _temp_dir: temp_dir,
        }
    }

    pub fn path(&self) -> PathBuf {
        self._temp_dir.path().join("storage.json")
    }

    pub fn storage(&self) -> Arc<MemoryStorage> {
        self.storage.clone()
    }

    /// Flush the snapshot and load it back, as a restarted node would.
    pub fn reopen(self) -> Self {
        self.storage.flush().expect("Failed to flush storage");
        let storage = MemoryStorage::open(self.path()).expect("Failed to reopen storage");
        Self {
            storage: Arc::new(storage),
            _temp_dir: self._temp_dir,
        }
    }
}

impl Default for TestStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestStorage {
    type Target = MemoryStorage;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

/// Regtest chain state: storage, blockchain and block syncer, wired the
/// way the node wires them.
pub struct SyncFixture {
    pub params: ChainParams,
    pub storage: TestStorage,
    pub blockchain: Arc<Blockchain>,
    pub block_syncer: Arc<BlockSyncer>,
    pub data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>>,
    pub sync_listeners: Arc<ListenerRegistry<dyn BlockSyncListener>>,
    pub bloom_filter_manager: Arc<BloomFilterManager>,
}

impl SyncFixture {
    pub fn new() -> Self {
        Self::with_sync_listener(None)
    }

    /// Build the fixture with `listener` registered before the syncer
    /// reports its starting height.
    pub fn with_sync_listener(listener: Option<Arc<dyn BlockSyncListener>>) -> Self {
        Self::with_storage(TestStorage::new(), listener)
    }

    /// Build the fixture over existing storage.
    pub fn with_storage(storage: TestStorage, listener: Option<Arc<dyn BlockSyncListener>>) -> Self {
        let params = regtest_params();
        let data_listeners: Arc<ListenerRegistry<dyn BlockchainDataListener>> =
            Arc::new(ListenerRegistry::new());
        let sync_listeners: Arc<ListenerRegistry<dyn BlockSyncListener>> =
            Arc::new(ListenerRegistry::new());
        if let Some(listener) = listener {
            sync_listeners.add(listener);
        }

        let blockchain = Arc::new(Blockchain::new(
            storage.storage(),
            params.validator_chain(),
            params.retarget_interval,
            data_listeners.clone(),
        ));
        let bloom_filter_manager = Arc::new(BloomFilterManager::new(Arc::new(StaticElements(
            vec![b"wallet".to_vec()],
        ))));
        let block_syncer = Arc::new(
            BlockSyncer::new(
                storage.storage(),
                blockchain.clone(),
                Arc::new(StoringTransactionProcessor::new(
                    storage.storage(),
                    data_listeners.clone(),
                )),
                Arc::new(NoGapFill),
                bloom_filter_manager.clone(),
                &params.checkpoint,
                sync_listeners.clone(),
            )
            .expect("Failed to create block syncer"),
        );

        Self {
            params,
            storage,
            blockchain,
            block_syncer,
            data_listeners,
            sync_listeners,
            bloom_filter_manager,
        }
    }

    pub fn genesis(&self) -> &BlockHeader {
        &self.params.checkpoint.header
    }
}

impl Default for SyncFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A peer pool and sync engine over a [`SyncFixture`], pointed at one
/// local peer.
pub struct TestNode {
    pub peer_group: Arc<PeerGroup>,
    pub peer_manager: Arc<PeerManager>,
    pub engine: Arc<SyncEngine>,
}

impl TestNode {
    /// Wire the pool the way the node binary does and start it.
    pub fn start(fixture: &SyncFixture, port: u16, strategy: SyncStrategy) -> Self {
        let params = fixture.params.clone().with_port(port);
        let peer_manager = Arc::new(PeerManager::new());
        let address_manager = PeerAddressManager::new(
            fixture.storage.storage(),
            PeerDiscovery::new(Vec::new(), params.default_port),
        );
        address_manager
            .add_ips(&["127.0.0.1".to_string()])
            .expect("Failed to add peer address");

        let group_config = PeerGroupConfig {
            peer_count: 1,
            max_block_size: params.max_block_size,
            ..PeerGroupConfig::default()
        };
        let peer_group = PeerGroup::new(
            group_config,
            ConnectionConfig::for_chain(&params),
            address_manager,
            peer_manager.clone(),
        );
        let local_height = fixture
            .block_syncer
            .local_downloaded_best_block_height()
            .expect("Failed to read local height");
        peer_group.set_local_best_height(local_height);

        let engine = SyncEngine::new(
            SyncConfig {
                strategy,
                ..SyncConfig::default()
            },
            fixture.block_syncer.clone(),
            peer_manager.clone(),
            fixture.sync_listeners.clone(),
        );
        let loader = Arc::new(BloomFilterLoader::new(
            fixture.bloom_filter_manager.clone(),
            peer_manager.clone(),
        ));
        fixture.bloom_filter_manager.add_listener(loader.clone());

        peer_group.add_listener(loader);
        peer_group.add_listener(engine.clone());
        peer_group.set_inventory_items_handler(engine.clone());
        peer_group.set_peer_task_handler(engine.clone());
        peer_group.start();

        Self {
            peer_group,
            peer_manager,
            engine,
        }
    }

    /// Stop the pool and wait for the engine to drain.
    pub async fn stop(&self) {
        self.peer_group.stop();
        self.engine.barrier().await;
        self.engine.shutdown();
    }
}

/// Poll `condition` every 50ms until it holds or `timeout` passes.
pub async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// What the fake peer saw.
#[derive(Debug, Default)]
pub struct FakePeerLog {
    /// Commands received, in order.
    pub commands: Vec<String>,
    /// Number of `getdata` items requested.
    pub requested_blocks: usize,
    /// Largest `getdata` batch.
    pub largest_batch: usize,
}

/// A remote node serving `chain` (genesis first) on localhost.
pub struct FakePeer {
    addr: SocketAddr,
    log: Arc<Mutex<FakePeerLog>>,
    handle: JoinHandle<()>,
}

impl FakePeer {
    /// Bind a random port and serve connections until dropped.
    pub async fn spawn(magic: [u8; 4], genesis: BlockHeader, chain: Vec<MinedBlock>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake peer");
        let addr = listener.local_addr().expect("Fake peer address");
        let log = Arc::new(Mutex::new(FakePeerLog::default()));
        let served = Arc::new(ServedChain { genesis, chain });

        let task_log = log.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let served = served.clone();
                let log = task_log.clone();
                tokio::spawn(async move { serve(stream, magic, served, log).await });
            }
        });

        Self { addr, log, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn log(&self) -> parking_lot::MutexGuard<'_, FakePeerLog> {
        self.log.lock()
    }

    /// Whether a command was received at least once.
    pub fn received(&self, command: &str) -> bool {
        self.log.lock().commands.iter().any(|c| c == command)
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ServedChain {
    genesis: BlockHeader,
    chain: Vec<MinedBlock>,
}

impl ServedChain {
    fn height(&self) -> usize {
        self.chain.len()
    }

    /// Height of a known hash, genesis being 0.
    fn height_of(&self, hash: &Hash256) -> Option<usize> {
        if *hash == self.genesis.hash() {
            return Some(0);
        }
        self.chain
            .iter()
            .position(|b| b.hash() == *hash)
            .map(|i| i + 1)
    }

    fn block(&self, hash: &Hash256) -> Option<&MinedBlock> {
        self.chain.iter().find(|b| b.hash() == *hash)
    }
}

fn version_for(height: usize) -> VersionMessage {
    VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        services: SERVICE_FULL_NODE | SERVICE_BLOOM_FILTER,
        timestamp: 0,
        recv_address: NetworkAddress::unspecified(),
        from_address: NetworkAddress::unspecified(),
        nonce: rand::random(),
        user_agent: "/fake-peer:0.1.0/".to_string(),
        start_height: height as i32,
        relay: false,
    }
}

async fn serve(stream: TcpStream, magic: [u8; 4], served: Arc<ServedChain>, log: Arc<Mutex<FakePeerLog>>) {
    let mut framed = Framed::new(stream, MessageCodec::with_magic(magic));

    while let Some(Ok(message)) = framed.next().await {
        log.lock().commands.push(message.command().to_string());

        let replies = match message {
            Message::Version(_) => vec![
                Message::Version(version_for(served.height())),
                Message::VerAck,
            ],
            Message::Ping(nonce) => vec![Message::Pong(nonce)],
            Message::GetBlocks(request) => {
                let start = request
                    .locator
                    .iter()
                    .find_map(|hash| served.height_of(hash))
                    .unwrap_or(0);
                let items: Vec<InventoryItem> = served
                    .chain
                    .iter()
                    .skip(start)
                    .take(500)
                    .map(|b| InventoryItem::new(InventoryType::Block, b.hash()))
                    .collect();
                if items.is_empty() {
                    vec![]
                } else {
                    vec![Message::Inv(items)]
                }
            }
            Message::GetData(items) => {
                {
                    let mut log = log.lock();
                    log.requested_blocks += items.len();
                    log.largest_batch = log.largest_batch.max(items.len());
                }
                let mut replies = Vec::new();
                for item in items.iter().filter(|i| i.kind == InventoryType::FilteredBlock) {
                    if let Some(block) = served.block(&item.hash) {
                        replies.push(Message::MerkleBlock(block.merkle_block_message()));
                        replies.extend(block.matched_transactions().into_iter().map(Message::Tx));
                    }
                }
                replies
            }
            _ => vec![],
        };

        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}
