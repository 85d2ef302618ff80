//! End-to-end sync tests.
//!
//! A [`FakePeer`] serves a mined regtest chain over TCP and the full
//! client stack (pool, peer workers, tasks, engine, block syncer) pulls
//! it down.

use crate::generators::{mine_chain, mine_chain_with_bad_bits, mine_chain_with_matches};
use crate::harness::{wait_for, FakePeer, SyncFixture, TestNode, TestStorage};
use parking_lot::Mutex;
use spv_storage::Storage;
use spv_sync::{BlockSyncListener, SyncState, SyncStateTracker, SyncStrategy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Counts sync lifecycle callbacks.
#[derive(Default)]
struct Callbacks {
    started: AtomicUsize,
    finished: AtomicUsize,
    heights: Mutex<Vec<(u32, u32)>>,
}

impl BlockSyncListener for Callbacks {
    fn on_sync_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_current_best_block_height_update(&self, height: u32, max_block_height: u32) {
        self.heights.lock().push((height, max_block_height));
    }

    fn on_block_sync_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Initial Block Download
// ============================================================================

#[tokio::test]
async fn test_initial_sync_downloads_whole_chain() {
    let tracker = Arc::new(SyncStateTracker::new());
    let fixture = SyncFixture::with_sync_listener(Some(tracker.clone()));
    let callbacks = Arc::new(Callbacks::default());
    fixture.sync_listeners.add(callbacks.clone());

    let chain = mine_chain_with_matches(fixture.genesis(), 100, 1, 10);
    let peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain.clone()).await;
    let node = TestNode::start(&fixture, peer.port(), SyncStrategy::Initial);

    assert!(
        wait_for(SYNC_TIMEOUT, || callbacks.finished.load(Ordering::SeqCst) == 1).await,
        "sync did not finish: {}",
        tracker.state()
    );
    node.engine.barrier().await;
    assert_eq!(tracker.state(), SyncState::Synced);

    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 100);
    let tip = fixture.storage.last_block().unwrap().unwrap();
    assert_eq!(tip.hash, chain[99].hash());
    assert!(!tip.stale);
    assert!(fixture.storage.blocks_by_stale(true).unwrap().is_empty());
    assert!(fixture.storage.block_hashes_sorted(usize::MAX).unwrap().is_empty());

    assert_eq!(callbacks.started.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks.finished.load(Ordering::SeqCst), 1);
    let heights = callbacks.heights.lock().clone();
    assert_eq!(heights.len(), 100);
    assert!(heights.iter().all(|(_, max)| *max == 100));

    node.stop().await;
}

#[tokio::test]
async fn test_matched_transactions_are_stored() {
    let fixture = SyncFixture::new();
    let chain = mine_chain_with_matches(fixture.genesis(), 30, 2, 10);
    let peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain.clone()).await;
    let node = TestNode::start(&fixture, peer.port(), SyncStrategy::Initial);

    let syncer = fixture.block_syncer.clone();
    assert!(
        wait_for(SYNC_TIMEOUT, || {
            node.engine.synced_peers().len() == 1
                && syncer.local_downloaded_best_block_height().unwrap_or(0) == 30
        })
        .await
    );

    for block in &chain {
        let stored = fixture.storage.block_transactions(&block.hash()).unwrap();
        let expected = block.matched_transactions();
        assert_eq!(stored.len(), expected.len(), "block {}", block.hash());
        for tx in &expected {
            assert!(stored.iter().any(|s| s.hash == tx.hash));
        }
        let header = fixture.storage.block(&block.hash()).unwrap().unwrap();
        assert_eq!(header.has_transactions, !expected.is_empty());
    }

    node.stop().await;
}

#[tokio::test]
async fn test_peer_receives_filter_then_requests() {
    let fixture = SyncFixture::new();
    let chain = mine_chain(fixture.genesis(), 20, 3);
    let peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain).await;
    let node = TestNode::start(&fixture, peer.port(), SyncStrategy::Initial);

    assert!(wait_for(SYNC_TIMEOUT, || peer.received("mempool")).await);
    node.stop().await;

    let log = peer.log();
    let position = |command: &str| log.commands.iter().position(|c| c == command);
    assert_eq!(log.commands.first().map(String::as_str), Some("version"));
    let filter = position("filterload").expect("filter was never loaded");
    let blocks = position("getblocks").expect("hashes were never requested");
    let data = position("getdata").expect("blocks were never requested");
    assert!(filter < data);
    assert!(blocks < data);
    assert_eq!(log.requested_blocks, 20);
    assert!(log.largest_batch <= SyncStrategy::Initial.batch_size());
}

#[tokio::test]
async fn test_sync_resumes_after_restart() {
    let fixture = SyncFixture::new();
    let chain = mine_chain(fixture.genesis(), 100, 4);

    {
        let peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain[..60].to_vec()).await;
        let node = TestNode::start(&fixture, peer.port(), SyncStrategy::Initial);
        assert!(wait_for(SYNC_TIMEOUT, || node.engine.synced_peers().len() == 1).await);
        node.stop().await;
    }

    let SyncFixture { storage, .. } = fixture;
    let storage: TestStorage = storage.reopen();
    let callbacks = Arc::new(Callbacks::default());
    let fixture = SyncFixture::with_storage(storage, Some(callbacks.clone()));
    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 60);

    let peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain.clone()).await;
    let node = TestNode::start(&fixture, peer.port(), SyncStrategy::Initial);
    assert!(wait_for(SYNC_TIMEOUT, || callbacks.finished.load(Ordering::SeqCst) == 1).await);
    node.stop().await;

    assert_eq!(
        fixture.storage.last_block().unwrap().unwrap().hash,
        chain[99].hash()
    );
    // Only the missing blocks were fetched.
    assert_eq!(peer.log().requested_blocks, 40);
}

#[tokio::test]
async fn test_synced_node_stays_put_when_peer_has_nothing_new() {
    let fixture = SyncFixture::new();
    let chain = mine_chain(fixture.genesis(), 10, 5);

    let first = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain.clone()).await;
    let node = TestNode::start(&fixture, first.port(), SyncStrategy::Initial);
    assert!(wait_for(SYNC_TIMEOUT, || node.engine.synced_peers().len() == 1).await);
    node.stop().await;

    let second = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain).await;
    let node = TestNode::start(&fixture, second.port(), SyncStrategy::Incremental);
    assert!(wait_for(SYNC_TIMEOUT, || node.engine.synced_peers().len() == 1).await);
    node.stop().await;

    assert_eq!(second.log().requested_blocks, 0);
    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 10);
}

// ============================================================================
// Invalid Data
// ============================================================================

#[tokio::test]
async fn test_invalid_block_keeps_peer_and_sync_resumes() {
    let callbacks = Arc::new(Callbacks::default());
    let fixture = SyncFixture::with_sync_listener(Some(callbacks.clone()));
    // Height 15 has the wrong bits; 16..20 build on it.
    let bad_chain = mine_chain_with_bad_bits(fixture.genesis(), 20, 6, 14);

    let bad_peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), bad_chain.clone()).await;
    let node = TestNode::start(&fixture, bad_peer.port(), SyncStrategy::Initial);
    assert!(wait_for(SYNC_TIMEOUT, || node.engine.synced_peers().len() == 1).await);
    node.engine.barrier().await;

    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 14);
    assert!(fixture.storage.block(&bad_chain[14].hash()).unwrap().is_none());
    assert!(fixture.storage.block(&bad_chain[15].hash()).unwrap().is_none());
    assert!(fixture.storage.block_hashes_sorted(usize::MAX).unwrap().is_empty());

    // The peer served bad data but is neither dropped nor forgotten.
    assert_eq!(node.peer_manager.connected_count(), 1);
    assert_eq!(
        bad_peer.log().commands.iter().filter(|c| *c == "version").count(),
        1
    );
    assert_eq!(fixture.storage.peer_addresses_count().unwrap(), 1);
    assert_eq!(callbacks.finished.load(Ordering::SeqCst), 0);
    node.stop().await;

    let mut good_chain = bad_chain[..14].to_vec();
    good_chain.extend(mine_chain(&bad_chain[13].header, 6, 7));
    let good_peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), good_chain.clone()).await;
    let node = TestNode::start(&fixture, good_peer.port(), SyncStrategy::Initial);
    assert!(wait_for(SYNC_TIMEOUT, || callbacks.finished.load(Ordering::SeqCst) == 1).await);
    node.stop().await;

    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 20);
    assert_eq!(
        fixture.storage.last_block().unwrap().unwrap().hash,
        good_chain[19].hash()
    );
    assert_eq!(good_peer.log().requested_blocks, 6);
}

#[tokio::test]
async fn test_invalid_tip_does_not_loop() {
    let fixture = SyncFixture::new();
    let chain = mine_chain_with_bad_bits(fixture.genesis(), 10, 8, 9);
    let peer = FakePeer::spawn(fixture.params.magic, fixture.genesis().clone(), chain.clone()).await;
    let node = TestNode::start(&fixture, peer.port(), SyncStrategy::Initial);

    assert!(wait_for(SYNC_TIMEOUT, || node.engine.synced_peers().len() == 1).await);
    node.engine.barrier().await;
    let requested = peer.log().requested_blocks;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 9);
    assert!(fixture.storage.block(&chain[9].hash()).unwrap().is_none());
    // 9 good blocks, then the bad tip twice: once in the first batch, once retried.
    assert_eq!(requested, 11);
    assert_eq!(peer.log().requested_blocks, requested);
    assert_eq!(node.peer_manager.connected_count(), 1);
    node.stop().await;
}
