//! Fork resolution through the block syncer.
//!
//! Merkle blocks are fed straight into [`BlockSyncer`] the way the sync
//! engine does: queue hashes, deliver blocks, then complete the download.

use crate::generators::{mine_chain, mine_chain_with_matches, MinedBlock};
use crate::harness::SyncFixture;
use parking_lot::Mutex;
use spv_consensus::Hash256;
use spv_storage::Storage;
use spv_sync::BlockchainDataListener;
use std::sync::Arc;

#[derive(Default)]
struct DeletedTransactions(Mutex<Vec<Hash256>>);

impl BlockchainDataListener for DeletedTransactions {
    fn on_transactions_delete(&self, hashes: &[Hash256]) {
        self.0.lock().extend_from_slice(hashes);
    }
}

/// One download round: queue, deliver, complete.
fn download(fixture: &SyncFixture, blocks: &[MinedBlock]) {
    let syncer = &fixture.block_syncer;
    syncer.prepare_for_download().unwrap();
    let hashes: Vec<Hash256> = blocks.iter().map(|b| b.hash()).collect();
    syncer.add_block_hashes(&hashes).unwrap();

    let max = blocks.len() as u32;
    for block in blocks {
        syncer.handle_merkle_block(&block.merkle_block(), max).unwrap();
    }
    syncer.download_iteration_completed().unwrap();
    syncer.download_completed().unwrap();
}

fn tip(fixture: &SyncFixture) -> Hash256 {
    fixture.storage.last_block().unwrap().unwrap().hash
}

// ============================================================================
// Competing Branches
// ============================================================================

#[test]
fn test_longer_branch_replaces_main_chain() {
    let fixture = SyncFixture::new();
    let deleted = Arc::new(DeletedTransactions::default());
    fixture.data_listeners.add(deleted.clone());

    let main = mine_chain_with_matches(fixture.genesis(), 10, 1, 5);
    download(&fixture, &main);
    assert_eq!(tip(&fixture), main[9].hash());

    // Fork after block 4, two blocks longer.
    let fork = mine_chain(&main[3].header, 8, 2);
    download(&fixture, &fork);

    assert_eq!(tip(&fixture), fork[7].hash());
    assert_eq!(fixture.block_syncer.local_downloaded_best_block_height().unwrap(), 12);
    for block in &main[4..] {
        assert!(fixture.storage.block(&block.hash()).unwrap().is_none());
    }
    for block in &main[..4] {
        assert!(fixture.storage.block(&block.hash()).unwrap().is_some());
    }

    // Blocks 5 and 10 carried wallet transactions; both were orphaned.
    let orphaned: Vec<Hash256> = main[4..]
        .iter()
        .flat_map(|b| b.matched_transactions())
        .map(|t| t.hash)
        .collect();
    assert_eq!(orphaned.len(), 2);
    let reported = deleted.0.lock().clone();
    for hash in orphaned {
        assert!(reported.contains(&hash));
    }
}

#[test]
fn test_shorter_branch_is_discarded() {
    let fixture = SyncFixture::new();
    let main = mine_chain(fixture.genesis(), 10, 1);
    download(&fixture, &main);

    let fork = mine_chain(&main[5].header, 2, 2);
    download(&fixture, &fork);

    assert_eq!(tip(&fixture), main[9].hash());
    for block in &fork {
        assert!(fixture.storage.block(&block.hash()).unwrap().is_none());
    }
    assert!(fixture.storage.blocks_by_stale(true).unwrap().is_empty());
}

#[test]
fn test_equal_length_branch_keeps_main_chain() {
    let fixture = SyncFixture::new();
    let main = mine_chain(fixture.genesis(), 6, 1);
    download(&fixture, &main);

    let fork = mine_chain(&main[2].header, 3, 2);
    download(&fixture, &fork);

    assert_eq!(tip(&fixture), main[5].hash());
    assert!(fixture.storage.block(&fork[2].hash()).unwrap().is_none());
}

#[test]
fn test_extension_without_overlap_is_accepted() {
    let fixture = SyncFixture::new();
    let chain = mine_chain(fixture.genesis(), 12, 1);
    download(&fixture, &chain[..7]);
    download(&fixture, &chain[7..]);

    assert_eq!(tip(&fixture), chain[11].hash());
    assert!(fixture.storage.blocks_by_stale(true).unwrap().is_empty());
}

#[test]
fn test_interrupted_fork_is_resolved_on_next_start() {
    let fixture = SyncFixture::new();
    let main = mine_chain(fixture.genesis(), 5, 1);
    download(&fixture, &main);

    // Longer branch arrives but the download never completes.
    let fork = mine_chain(&main[1].header, 6, 2);
    let syncer = &fixture.block_syncer;
    syncer.prepare_for_download().unwrap();
    for block in &fork {
        syncer.handle_merkle_block(&block.merkle_block(), 8).unwrap();
    }
    assert!(!fixture.storage.blocks_by_stale(true).unwrap().is_empty());

    syncer.prepare_for_download().unwrap();
    assert_eq!(tip(&fixture), fork[5].hash());
    assert!(fixture.storage.blocks_by_stale(true).unwrap().is_empty());
}
