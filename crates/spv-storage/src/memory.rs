//! In-memory storage with an optional JSON snapshot file.

use crate::{PeerAddress, Storage, StorageError, StorageResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spv_consensus::{Block, BlockHash, Hash256, Transaction};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Default)]
struct State {
    blocks: HashMap<Hash256, Block>,
    transactions: HashMap<Hash256, Vec<Transaction>>,
    block_hashes: HashMap<Hash256, BlockHash>,
    peer_addresses: HashMap<String, PeerAddress>,
}

/// On-disk form of [`State`].
#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    blocks: Vec<Block>,
    transactions: Vec<(Hash256, Vec<Transaction>)>,
    block_hashes: Vec<BlockHash>,
    peer_addresses: Vec<PeerAddress>,
}

impl From<Snapshot> for State {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            blocks: snapshot.blocks.into_iter().map(|b| (b.hash, b)).collect(),
            transactions: snapshot.transactions.into_iter().collect(),
            block_hashes: snapshot
                .block_hashes
                .into_iter()
                .map(|h| (h.header_hash, h))
                .collect(),
            peer_addresses: snapshot
                .peer_addresses
                .into_iter()
                .map(|a| (a.ip.clone(), a))
                .collect(),
        }
    }
}

impl State {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            blocks: self.blocks.values().cloned().collect(),
            transactions: self
                .transactions
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            block_hashes: self.block_hashes.values().cloned().collect(),
            peer_addresses: self.peer_addresses.values().cloned().collect(),
        }
    }

    fn sorted_hashes(&self) -> Vec<BlockHash> {
        let mut hashes: Vec<BlockHash> = self.block_hashes.values().cloned().collect();
        hashes.sort_by_key(|h| h.sequence);
        hashes
    }

    fn remove_block(&mut self, hash: &Hash256) {
        self.blocks.remove(hash);
        self.transactions.remove(hash);
    }
}

/// Thread-safe in-memory [`Storage`].
pub struct MemoryStorage {
    state: RwLock<State>,
    path: Option<PathBuf>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty, non-persistent storage.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
        }
    }

    /// Open storage backed by a snapshot file, loading it if it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening storage at {:?}", path);

        let state = if path.exists() {
            let data = fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&data)?;
            let state = State::from(snapshot);
            debug!(
                blocks = state.blocks.len(),
                block_hashes = state.block_hashes.len(),
                peers = state.peer_addresses.len(),
                "Snapshot loaded"
            );
            state
        } else {
            State::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    /// Write the snapshot file atomically (no-op without a path).
    pub fn flush(&self) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec(&self.state.read().snapshot())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;

        debug!("Snapshot written to {:?}", path);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn block(&self, hash: &Hash256) -> StorageResult<Option<Block>> {
        Ok(self.state.read().blocks.get(hash).cloned())
    }

    fn block_by_height(&self, height: u32) -> StorageResult<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .blocks
            .values()
            .filter(|b| b.height == height)
            .min_by_key(|b| b.stale)
            .cloned())
    }

    fn last_block(&self) -> StorageResult<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .blocks
            .values()
            .max_by_key(|b| (b.height, Reverse(b.stale)))
            .cloned())
    }

    fn blocks_count(&self, hashes: &[Hash256]) -> StorageResult<usize> {
        let state = self.state.read();
        Ok(hashes.iter().filter(|h| state.blocks.contains_key(h)).count())
    }

    fn lowest_block(&self, stale: bool) -> StorageResult<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .blocks
            .values()
            .filter(|b| b.stale == stale)
            .min_by_key(|b| b.height)
            .cloned())
    }

    fn highest_block(&self, stale: bool) -> StorageResult<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .blocks
            .values()
            .filter(|b| b.stale == stale)
            .max_by_key(|b| b.height)
            .cloned())
    }

    fn blocks_by_stale(&self, stale: bool) -> StorageResult<Vec<Block>> {
        let state = self.state.read();
        let mut blocks: Vec<Block> = state
            .blocks
            .values()
            .filter(|b| b.stale == stale)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }

    fn blocks_from_height(&self, height: u32, stale: bool) -> StorageResult<Vec<Block>> {
        let state = self.state.read();
        let mut blocks: Vec<Block> = state
            .blocks
            .values()
            .filter(|b| b.height >= height && b.stale == stale)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.height);
        Ok(blocks)
    }

    fn blocks_above(&self, height: u32, limit: usize) -> StorageResult<Vec<Block>> {
        let state = self.state.read();
        let mut blocks: Vec<Block> = state
            .blocks
            .values()
            .filter(|b| b.height > height)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| Reverse(b.height));
        blocks.truncate(limit);
        Ok(blocks)
    }

    fn blocks_by_hashes(&self, hashes: &[Hash256]) -> StorageResult<Vec<Block>> {
        let state = self.state.read();
        Ok(hashes
            .iter()
            .filter_map(|h| state.blocks.get(h).cloned())
            .collect())
    }

    fn add_block(&self, block: &Block) -> StorageResult<()> {
        self.state.write().blocks.insert(block.hash, block.clone());
        Ok(())
    }

    fn update_block(&self, block: &Block) -> StorageResult<()> {
        let mut state = self.state.write();
        match state.blocks.get_mut(&block.hash) {
            Some(existing) => {
                *existing = block.clone();
                Ok(())
            }
            None => Err(StorageError::Corruption(format!(
                "update of unknown block {}",
                block.hash
            ))),
        }
    }

    fn unstale_all_blocks(&self) -> StorageResult<()> {
        for block in self.state.write().blocks.values_mut() {
            block.stale = false;
        }
        Ok(())
    }

    fn delete_blocks(&self, blocks: &[Block]) -> StorageResult<()> {
        let mut state = self.state.write();
        for block in blocks {
            state.remove_block(&block.hash);
        }
        Ok(())
    }

    fn delete_blocks_without_transactions(&self, below_height: u32) -> StorageResult<usize> {
        let mut state = self.state.write();
        let doomed: Vec<Hash256> = state
            .blocks
            .values()
            .filter(|b| b.height < below_height && !b.has_transactions)
            .map(|b| b.hash)
            .collect();
        for hash in &doomed {
            state.remove_block(hash);
        }
        Ok(doomed.len())
    }

    fn block_transactions(&self, block_hash: &Hash256) -> StorageResult<Vec<Transaction>> {
        Ok(self
            .state
            .read()
            .transactions
            .get(block_hash)
            .cloned()
            .unwrap_or_default())
    }

    fn add_transactions(&self, block_hash: &Hash256, transactions: &[Transaction]) -> StorageResult<()> {
        let mut state = self.state.write();
        let stored = state.transactions.entry(*block_hash).or_default();
        let known: HashSet<Hash256> = stored.iter().map(|t| t.hash).collect();
        stored.extend(
            transactions
                .iter()
                .filter(|t| !known.contains(&t.hash))
                .cloned(),
        );
        Ok(())
    }

    fn last_block_hash(&self) -> StorageResult<Option<BlockHash>> {
        let state = self.state.read();
        Ok(state.block_hashes.values().max_by_key(|h| h.sequence).cloned())
    }

    fn last_blockchain_block_hash(&self) -> StorageResult<Option<BlockHash>> {
        let state = self.state.read();
        Ok(state
            .block_hashes
            .values()
            .filter(|h| h.height == 0)
            .max_by_key(|h| h.sequence)
            .cloned())
    }

    fn blockchain_block_hashes(&self) -> StorageResult<Vec<BlockHash>> {
        let state = self.state.read();
        Ok(state
            .sorted_hashes()
            .into_iter()
            .filter(|h| h.height == 0)
            .collect())
    }

    fn block_hash_header_hashes(&self, except: &[Hash256]) -> StorageResult<Vec<Hash256>> {
        let state = self.state.read();
        Ok(state
            .sorted_hashes()
            .into_iter()
            .map(|h| h.header_hash)
            .filter(|h| !except.contains(h))
            .collect())
    }

    fn block_hashes_sorted(&self, limit: usize) -> StorageResult<Vec<BlockHash>> {
        let mut hashes = self.state.read().sorted_hashes();
        hashes.truncate(limit);
        Ok(hashes)
    }

    fn block_hash_exists(&self, hash: &Hash256) -> StorageResult<bool> {
        Ok(self.state.read().block_hashes.contains_key(hash))
    }

    fn add_block_hashes(&self, hashes: &[BlockHash]) -> StorageResult<()> {
        let mut state = self.state.write();
        for hash in hashes {
            state.block_hashes.insert(hash.header_hash, hash.clone());
        }
        Ok(())
    }

    fn delete_block_hash(&self, hash: &Hash256) -> StorageResult<()> {
        self.state.write().block_hashes.remove(hash);
        Ok(())
    }

    fn delete_blockchain_block_hashes(&self) -> StorageResult<()> {
        self.state.write().block_hashes.retain(|_, h| h.height != 0);
        Ok(())
    }

    fn least_score_fastest_peer_address(&self, exclude: &[String]) -> StorageResult<Option<PeerAddress>> {
        let state = self.state.read();
        Ok(state
            .peer_addresses
            .values()
            .filter(|a| !exclude.contains(&a.ip))
            .min_by_key(|a| {
                (
                    a.score,
                    a.connection_time.is_some(),
                    a.connection_time.unwrap_or(0),
                    a.ip.clone(),
                )
            })
            .cloned())
    }

    fn set_peer_addresses(&self, addresses: &[PeerAddress]) -> StorageResult<()> {
        let mut state = self.state.write();
        for address in addresses {
            state
                .peer_addresses
                .entry(address.ip.clone())
                .or_insert_with(|| address.clone());
        }
        Ok(())
    }

    fn delete_peer_address(&self, ip: &str) -> StorageResult<()> {
        self.state.write().peer_addresses.remove(ip);
        Ok(())
    }

    fn mark_peer_connected(&self, ip: &str, connection_time: u64) -> StorageResult<()> {
        if let Some(address) = self.state.write().peer_addresses.get_mut(ip) {
            address.connection_time = Some(connection_time);
        }
        Ok(())
    }

    fn increase_peer_score(&self, ip: &str, by: i32) -> StorageResult<()> {
        if let Some(address) = self.state.write().peer_addresses.get_mut(ip) {
            address.score += by;
        }
        Ok(())
    }

    fn peer_addresses_count(&self) -> StorageResult<usize> {
        Ok(self.state.read().peer_addresses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv_consensus::{sha256d, BlockHeader};
    use tempfile::TempDir;

    fn block(height: u32, stale: bool) -> Block {
        let header = BlockHeader {
            version: 1,
            previous_block_hash: sha256d(&height.to_le_bytes()),
            merkle_root: Hash256::ZERO,
            timestamp: height,
            bits: 0x207fffff,
            nonce: stale as u32,
        };
        let mut block = Block::new(header, height);
        block.stale = stale;
        block
    }

    #[test]
    fn test_block_by_height_prefers_main_branch() {
        let storage = MemoryStorage::new();
        storage.add_block(&block(5, true)).unwrap();
        storage.add_block(&block(5, false)).unwrap();

        let found = storage.block_by_height(5).unwrap().unwrap();
        assert!(!found.stale);
    }

    #[test]
    fn test_stale_queries() {
        let storage = MemoryStorage::new();
        for h in 1..=5 {
            storage.add_block(&block(h, false)).unwrap();
        }
        for h in 4..=7 {
            storage.add_block(&block(h, true)).unwrap();
        }

        assert_eq!(storage.lowest_block(true).unwrap().unwrap().height, 4);
        assert_eq!(storage.highest_block(true).unwrap().unwrap().height, 7);
        assert_eq!(storage.highest_block(false).unwrap().unwrap().height, 5);
        assert_eq!(storage.blocks_from_height(4, false).unwrap().len(), 2);

        storage.unstale_all_blocks().unwrap();
        assert!(storage.lowest_block(true).unwrap().is_none());
        assert_eq!(storage.last_block().unwrap().unwrap().height, 7);
    }

    #[test]
    fn test_blocks_above_highest_first() {
        let storage = MemoryStorage::new();
        for h in 0..=20 {
            storage.add_block(&block(h, false)).unwrap();
        }

        let heights: Vec<u32> = storage
            .blocks_above(5, 3)
            .unwrap()
            .iter()
            .map(|b| b.height)
            .collect();
        assert_eq!(heights, vec![20, 19, 18]);
        assert!(storage.blocks_above(20, 10).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_blocks_with_transactions() {
        let storage = MemoryStorage::new();
        for h in 1..=10 {
            let mut b = block(h, false);
            b.has_transactions = h == 3;
            storage.add_block(&b).unwrap();
        }

        let removed = storage.delete_blocks_without_transactions(6).unwrap();
        assert_eq!(removed, 4);
        assert!(storage.block_by_height(3).unwrap().is_some());
        assert!(storage.block_by_height(5).unwrap().is_none());
        assert!(storage.block_by_height(6).unwrap().is_some());
    }

    #[test]
    fn test_delete_blocks_removes_transactions() {
        let storage = MemoryStorage::new();
        let b = block(1, false);
        storage.add_block(&b).unwrap();
        storage
            .add_transactions(&b.hash, &[Transaction::from_raw(vec![1, 2])])
            .unwrap();

        storage.delete_blocks(&[b.clone()]).unwrap();
        assert!(storage.block(&b.hash).unwrap().is_none());
        assert!(storage.block_transactions(&b.hash).unwrap().is_empty());
    }

    #[test]
    fn test_block_hash_queue() {
        let storage = MemoryStorage::new();
        let h = |i: u32| sha256d(&i.to_le_bytes());
        storage
            .add_block_hashes(&[
                BlockHash::new(h(1), 10, 1),
                BlockHash::new(h(2), 0, 2),
                BlockHash::new(h(3), 0, 3),
            ])
            .unwrap();

        assert_eq!(storage.last_block_hash().unwrap().unwrap().sequence, 3);
        assert_eq!(storage.blockchain_block_hashes().unwrap().len(), 2);
        assert_eq!(storage.block_hashes_sorted(2).unwrap()[0].header_hash, h(1));
        assert_eq!(storage.block_hash_header_hashes(&[h(2)]).unwrap(), vec![h(1), h(3)]);

        storage.delete_blockchain_block_hashes().unwrap();
        assert!(storage.last_blockchain_block_hash().unwrap().is_none());
        assert!(storage.block_hash_exists(&h(1)).unwrap());
    }

    #[test]
    fn test_peer_address_ordering() {
        let storage = MemoryStorage::new();
        storage
            .set_peer_addresses(&[
                PeerAddress::new("10.0.0.1"),
                PeerAddress::new("10.0.0.2"),
                PeerAddress::new("10.0.0.3"),
            ])
            .unwrap();

        storage.mark_peer_connected("10.0.0.1", 300).unwrap();
        storage.mark_peer_connected("10.0.0.2", 100).unwrap();
        storage.increase_peer_score("10.0.0.3", 3).unwrap();

        // Equal score: never-connected first, then fastest.
        storage.set_peer_addresses(&[PeerAddress::new("10.0.0.4")]).unwrap();
        let best = storage.least_score_fastest_peer_address(&[]).unwrap().unwrap();
        assert_eq!(best.ip, "10.0.0.4");

        let best = storage
            .least_score_fastest_peer_address(&["10.0.0.4".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(best.ip, "10.0.0.2");
    }

    #[test]
    fn test_set_peer_addresses_ignores_known() {
        let storage = MemoryStorage::new();
        storage.set_peer_addresses(&[PeerAddress::new("10.0.0.1")]).unwrap();
        storage.increase_peer_score("10.0.0.1", 3).unwrap();
        storage.set_peer_addresses(&[PeerAddress::new("10.0.0.1")]).unwrap();

        let best = storage.least_score_fastest_peer_address(&[]).unwrap().unwrap();
        assert_eq!(best.score, 3);
        assert_eq!(storage.peer_addresses_count().unwrap(), 1);
    }

    #[test]
    fn test_snapshot_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("storage.json");

        {
            let storage = MemoryStorage::open(&path).unwrap();
            storage.add_block(&block(1, false)).unwrap();
            storage.set_peer_addresses(&[PeerAddress::new("10.0.0.1")]).unwrap();
            storage.flush().unwrap();
        }

        let storage = MemoryStorage::open(&path).unwrap();
        assert_eq!(storage.last_block().unwrap().unwrap().height, 1);
        assert_eq!(storage.peer_addresses_count().unwrap(), 1);
    }

    #[test]
    fn test_update_unknown_block_fails() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.update_block(&block(1, false)),
            Err(StorageError::Corruption(_))
        ));
    }
}
