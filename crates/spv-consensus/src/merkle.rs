//! Partial merkle tree extraction (BIP37 `merkleblock`).
//!
//! The tree is walked depth first. Each visited node consumes one flag bit;
//! a node with flag 0 (or a leaf) consumes one hash. Leaves with flag 1 are
//! matched transactions.

use crate::block::{BlockHeader, MerkleBlock};
use crate::hash::{sha256d, Hash256};
use crate::{ConsensusError, ConsensusResult};
use std::collections::HashSet;

/// Lower bound on serialized transaction size, used to bound `tx_count`.
const MIN_TRANSACTION_SIZE: u32 = 60;

/// Raw `merkleblock` content as received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    /// Block header.
    pub header: BlockHeader,
    /// Total transactions in the block.
    pub tx_count: u32,
    /// Depth-first hash list.
    pub hashes: Vec<Hash256>,
    /// Depth-first flag bits, least significant bit first.
    pub flags: Vec<u8>,
}

/// Validates merkle blocks and collects the matched transaction ids.
#[derive(Debug, Clone)]
pub struct MerkleBlockExtractor {
    max_block_size: u32,
}

impl MerkleBlockExtractor {
    /// Create an extractor for a chain with the given block size limit.
    pub fn new(max_block_size: u32) -> Self {
        Self { max_block_size }
    }

    /// Check the proof against the header and return the merkle block.
    pub fn extract(&self, message: &MerkleBlockMessage) -> ConsensusResult<MerkleBlock> {
        let matched = self.matched_hashes(message)?;
        Ok(MerkleBlock::new(message.header.clone(), matched))
    }

    fn matched_hashes(&self, message: &MerkleBlockMessage) -> ConsensusResult<HashSet<Hash256>> {
        let tx_count = message.tx_count;
        let max_tx_count = self.max_block_size / MIN_TRANSACTION_SIZE;

        if tx_count < 1 || tx_count > max_tx_count {
            return Err(invalid(format!(
                "transaction count {} out of range 1..={}",
                tx_count, max_tx_count
            )));
        }
        if message.hashes.len() > tx_count as usize {
            return Err(invalid(format!(
                "{} hashes for {} transactions",
                message.hashes.len(),
                tx_count
            )));
        }
        if message.flags.is_empty() {
            return Err(invalid("empty flag bits".to_string()));
        }
        if message.flags.len() * 8 < message.hashes.len() {
            return Err(invalid("fewer flag bits than hashes".to_string()));
        }

        let mut walker = TreeWalker {
            tx_count,
            hashes: &message.hashes,
            flags: &message.flags,
            hash_pos: 0,
            bit_pos: 0,
            matched: HashSet::new(),
        };

        let height = tree_height(tx_count);
        let root = walker.traverse(height, 0)?;

        if walker.hash_pos != message.hashes.len() {
            return Err(invalid("not all hashes were consumed".to_string()));
        }
        if (walker.bit_pos + 7) / 8 != message.flags.len() {
            return Err(invalid("not all flag bytes were consumed".to_string()));
        }
        if root != message.header.merkle_root {
            return Err(invalid(format!(
                "merkle root mismatch: computed {}, header {}",
                root, message.header.merkle_root
            )));
        }

        Ok(walker.matched)
    }
}

fn invalid(reason: String) -> ConsensusError {
    ConsensusError::InvalidMerkleBlock(reason)
}

/// Number of nodes at `height` (0 = leaves).
fn tree_width(tx_count: u32, height: u32) -> u32 {
    (tx_count + (1 << height) - 1) >> height
}

fn tree_height(tx_count: u32) -> u32 {
    let mut height = 0;
    while tree_width(tx_count, height) > 1 {
        height += 1;
    }
    height
}

struct TreeWalker<'a> {
    tx_count: u32,
    hashes: &'a [Hash256],
    flags: &'a [u8],
    hash_pos: usize,
    bit_pos: usize,
    matched: HashSet<Hash256>,
}

impl TreeWalker<'_> {
    fn next_flag(&mut self) -> ConsensusResult<bool> {
        let byte = self
            .flags
            .get(self.bit_pos / 8)
            .ok_or_else(|| invalid("ran out of flag bits".to_string()))?;
        let bit = (byte >> (self.bit_pos % 8)) & 1 == 1;
        self.bit_pos += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> ConsensusResult<Hash256> {
        let hash = *self
            .hashes
            .get(self.hash_pos)
            .ok_or_else(|| invalid("ran out of hashes".to_string()))?;
        self.hash_pos += 1;
        Ok(hash)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> ConsensusResult<Hash256> {
        let parent_of_match = self.next_flag()?;

        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.insert(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.tx_count, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            if right == left {
                // CVE-2012-2459: identical siblings allow a duplicated subtree.
                return Err(invalid("duplicate sibling hashes".to_string()));
            }
            right
        } else {
            left
        };

        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(left.as_bytes());
        concat[32..].copy_from_slice(right.as_bytes());
        Ok(sha256d(&concat))
    }
}

/// Build a well-formed proof for `txids` matching `matches`.
///
/// Used by tests and by local tooling that serves merkle blocks. Entries
/// missing from `matches` count as unmatched; no transactions give an
/// empty proof.
pub fn build_partial_tree(txids: &[Hash256], matches: &[bool]) -> (Vec<Hash256>, Vec<u8>) {
    if txids.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let tx_count = txids.len() as u32;
    let mut hashes = Vec::new();
    let mut bits = Vec::new();

    fn node_hash(txids: &[Hash256], tx_count: u32, height: u32, pos: u32) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = node_hash(txids, tx_count, height - 1, pos * 2);
        let right = if pos * 2 + 1 < tree_width(tx_count, height - 1) {
            node_hash(txids, tx_count, height - 1, pos * 2 + 1)
        } else {
            left
        };
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(left.as_bytes());
        concat[32..].copy_from_slice(right.as_bytes());
        sha256d(&concat)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        txids: &[Hash256],
        matches: &[bool],
        tx_count: u32,
        height: u32,
        pos: u32,
        hashes: &mut Vec<Hash256>,
        bits: &mut Vec<bool>,
    ) {
        let start = (pos << height) as usize;
        let end = (((pos + 1) << height) as usize).min(txids.len());
        let parent_of_match = matches.iter().take(end).skip(start).any(|m| *m);
        bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            hashes.push(node_hash(txids, tx_count, height, pos));
        } else {
            build(txids, matches, tx_count, height - 1, pos * 2, hashes, bits);
            if pos * 2 + 1 < tree_width(tx_count, height - 1) {
                build(txids, matches, tx_count, height - 1, pos * 2 + 1, hashes, bits);
            }
        }
    }

    build(
        txids,
        matches,
        tx_count,
        tree_height(tx_count),
        0,
        &mut hashes,
        &mut bits,
    );

    let mut flags = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            flags[i / 8] |= 1 << (i % 8);
        }
    }

    (hashes, flags)
}

/// Merkle root of a full transaction id list.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    let all = vec![false; txids.len()];
    let (hashes, _) = build_partial_tree(txids, &all);
    hashes.first().copied().unwrap_or(Hash256::ZERO)
}
