//! Block, header, transaction and download-queue models.

use crate::hash::{sha256d, Hash256};
use crate::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 80;

/// An 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version.
    pub version: i32,
    /// Hash of the previous block header.
    pub previous_block_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact target.
    pub bits: u32,
    /// Nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte wire form.
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_block_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse the 80-byte wire form.
    pub fn parse(bytes: &[u8]) -> ConsensusResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ConsensusError::NoHeader(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let hash_at = |at: usize| {
            let mut h = [0u8; 32];
            h.copy_from_slice(&bytes[at..at + 32]);
            Hash256(h)
        };

        Ok(Self {
            version: u32_at(0) as i32,
            previous_block_hash: hash_at(4),
            merkle_root: hash_at(36),
            timestamp: u32_at(68),
            bits: u32_at(72),
            nonce: u32_at(76),
        })
    }

    /// Header hash (double SHA-256 of the serialized header).
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }
}

/// A block stored in the local chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header.
    pub header: BlockHeader,
    /// Cached header hash.
    pub hash: Hash256,
    /// Height in the chain.
    pub height: u32,
    /// Tentatively connected, pending fork resolution.
    pub stale: bool,
    /// At least one wallet transaction was stored for this block.
    pub has_transactions: bool,
}

impl Block {
    /// Create a block at `height`.
    pub fn new(header: BlockHeader, height: u32) -> Self {
        let hash = header.hash();
        Self {
            header,
            hash,
            height,
            stale: false,
            has_transactions: false,
        }
    }

    /// Create the child of `parent`.
    pub fn with_parent(header: BlockHeader, parent: &Block) -> Self {
        Self::new(header, parent.height + 1)
    }

    /// Timestamp as a signed number for timespan arithmetic.
    pub fn timestamp(&self) -> i64 {
        self.header.timestamp as i64
    }

    /// Compact target.
    pub fn bits(&self) -> u32 {
        self.header.bits
    }

    /// Hash of the previous block.
    pub fn previous_hash(&self) -> &Hash256 {
        &self.header.previous_block_hash
    }
}

/// A pending-download queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    /// Header hash to download.
    pub header_hash: Hash256,
    /// Known height, or 0 when the hash came from a locator response.
    pub height: u32,
    /// Monotonic insertion sequence.
    pub sequence: u64,
}

impl BlockHash {
    /// Create a queue entry.
    pub fn new(header_hash: Hash256, height: u32, sequence: u64) -> Self {
        Self {
            header_hash,
            height,
            sequence,
        }
    }
}

/// A raw transaction with its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id (double SHA-256 of `raw`).
    pub hash: Hash256,
    /// Serialized transaction.
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

impl Transaction {
    /// Wrap raw bytes, computing the id.
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            hash: sha256d(&raw),
            raw,
        }
    }
}

/// A merkle block reconstructed from the wire, with its matched transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    /// Block header.
    pub header: BlockHeader,
    /// Header hash.
    pub block_hash: Hash256,
    /// Height when known from the download queue.
    pub height: Option<u32>,
    /// Transaction ids the peer proved as matching the filter.
    pub associated_transaction_hashes: HashSet<Hash256>,
    /// Matched transactions received so far.
    pub associated_transactions: Vec<Transaction>,
}

impl MerkleBlock {
    /// Create with no transactions received yet.
    pub fn new(header: BlockHeader, associated_transaction_hashes: HashSet<Hash256>) -> Self {
        let block_hash = header.hash();
        Self {
            header,
            block_hash,
            height: None,
            associated_transaction_hashes,
            associated_transactions: Vec::new(),
        }
    }

    /// Every proven transaction has been received.
    pub fn complete(&self) -> bool {
        self.associated_transactions.len() == self.associated_transaction_hashes.len()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bitcoin mainnet genesis header.
    fn genesis_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: Hash256::ZERO,
            merkle_root: Hash256::from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            )
            .unwrap(),
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn test_genesis_hash() {
        assert_eq!(
            genesis_header().hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_header_parse_matches_serialize() {
        let header = genesis_header();
        let bytes = header.serialize();
        assert_eq!(BlockHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_parse_short_input() {
        assert!(matches!(
            BlockHeader::parse(&[0u8; 79]),
            Err(ConsensusError::NoHeader(_))
        ));
    }

    #[test]
    fn test_block_with_parent() {
        let parent = Block::new(genesis_header(), 10);
        let child = Block::with_parent(genesis_header(), &parent);
        assert_eq!(child.height, 11);
        assert!(!child.stale);
    }

    #[test]
    fn test_merkle_block_complete() {
        let tx = Transaction::from_raw(vec![1, 2, 3]);
        let mut hashes = HashSet::new();
        hashes.insert(tx.hash);

        let mut merkle_block = MerkleBlock::new(genesis_header(), hashes);
        assert!(!merkle_block.complete());

        merkle_block.associated_transactions.push(tx);
        assert!(merkle_block.complete());
    }
}
