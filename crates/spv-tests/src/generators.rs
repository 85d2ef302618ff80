//! Test data generators for integration tests.
//!
//! Mines regtest headers (minimum difficulty, a few nonces each) and the
//! merkle proofs a peer would serve for them.

use spv_consensus::merkle::{build_partial_tree, merkle_root};
use spv_consensus::{
    check_proof_of_work, BlockHeader, ChainParams, Hash256, MerkleBlock, MerkleBlockMessage,
    Transaction,
};
use std::collections::HashSet;

/// Regtest minimum difficulty.
pub const REGTEST_BITS: u32 = 0x207fffff;

/// Regtest chain parameters.
pub fn regtest_params() -> ChainParams {
    ChainParams::regtest().expect("regtest checkpoint")
}

/// A mined block with its full transaction list.
#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Which transactions a bloom filter would match.
    pub matched: Vec<bool>,
}

impl MinedBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|t| t.hash).collect()
    }

    pub fn matched_transactions(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .zip(&self.matched)
            .filter(|(_, m)| **m)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// The `merkleblock` a peer would send for this block.
    pub fn merkle_block_message(&self) -> MerkleBlockMessage {
        let (hashes, flags) = build_partial_tree(&self.txids(), &self.matched);
        MerkleBlockMessage {
            header: self.header.clone(),
            tx_count: self.transactions.len() as u32,
            hashes,
            flags,
        }
    }

    /// Extracted form, with matched transactions attached.
    pub fn merkle_block(&self) -> MerkleBlock {
        let matched = self.matched_transactions();
        let hashes: HashSet<Hash256> = matched.iter().map(|t| t.hash).collect();
        let mut block = MerkleBlock::new(self.header.clone(), hashes);
        block.associated_transactions = matched;
        block
    }
}

/// Deterministic fake transaction.
pub fn fake_transaction(salt: u32, index: u32) -> Transaction {
    let mut raw = vec![0x01, 0x00, 0x00, 0x00];
    raw.extend_from_slice(&salt.to_le_bytes());
    raw.extend_from_slice(&index.to_le_bytes());
    Transaction::from_raw(raw)
}

/// Find a nonce that satisfies `header.bits`.
pub fn solve(mut header: BlockHeader) -> BlockHeader {
    while check_proof_of_work(&header.hash(), header.bits).is_err() {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// Mine one block on `parent` holding `transactions`.
pub fn mine_block(parent: &BlockHeader, transactions: Vec<Transaction>, matched: Vec<bool>) -> MinedBlock {
    mine_block_with_bits(parent, REGTEST_BITS, transactions, matched)
}

/// Mine one block on `parent` with explicit `bits`. Anything but
/// [`REGTEST_BITS`] fails regtest difficulty validation.
pub fn mine_block_with_bits(
    parent: &BlockHeader,
    bits: u32,
    transactions: Vec<Transaction>,
    matched: Vec<bool>,
) -> MinedBlock {
    let header = solve(BlockHeader {
        version: 1,
        previous_block_hash: parent.hash(),
        merkle_root: merkle_root(&transactions.iter().map(|t| t.hash).collect::<Vec<_>>()),
        timestamp: parent.timestamp + 600,
        bits,
        nonce: 0,
    });
    MinedBlock {
        header,
        transactions,
        matched,
    }
}

/// Mine `count` blocks on `from` where the block at `bad_index` carries
/// the wrong difficulty bits. Blocks after it build on it.
pub fn mine_chain_with_bad_bits(from: &BlockHeader, count: usize, salt: u32, bad_index: usize) -> Vec<MinedBlock> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = from.clone();
    for i in 0..count {
        let bits = if i == bad_index { 0x2000ffff } else { REGTEST_BITS };
        let block = mine_block_with_bits(&parent, bits, vec![fake_transaction(salt, i as u32)], vec![false]);
        parent = block.header.clone();
        blocks.push(block);
    }
    blocks
}

/// Mine `count` blocks on `from`, one unmatched transaction each. `salt`
/// keeps competing branches apart.
pub fn mine_chain(from: &BlockHeader, count: usize, salt: u32) -> Vec<MinedBlock> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = from.clone();
    for i in 0..count {
        let block = mine_block(&parent, vec![fake_transaction(salt, i as u32)], vec![false]);
        parent = block.header.clone();
        blocks.push(block);
    }
    blocks
}

/// Like [`mine_chain`], but every `every`-th block also carries a matched
/// transaction.
pub fn mine_chain_with_matches(from: &BlockHeader, count: usize, salt: u32, every: usize) -> Vec<MinedBlock> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = from.clone();
    for i in 0..count {
        let base = fake_transaction(salt, i as u32);
        let block = if every > 0 && (i + 1) % every == 0 {
            let wallet = fake_transaction(salt.wrapping_add(0x8000_0000), i as u32);
            mine_block(&parent, vec![base, wallet], vec![false, true])
        } else {
            mine_block(&parent, vec![base], vec![false])
        };
        parent = block.header.clone();
        blocks.push(block);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv_consensus::MerkleBlockExtractor;

    #[test]
    fn test_mined_chain_links_and_verifies() {
        let params = regtest_params();
        let chain = mine_chain(&params.checkpoint.header, 5, 1);

        assert_eq!(chain[0].header.previous_block_hash, params.checkpoint.hash());
        for pair in chain.windows(2) {
            assert_eq!(pair[1].header.previous_block_hash, pair[0].hash());
        }

        let extractor = MerkleBlockExtractor::new(params.max_block_size);
        for block in &chain {
            let extracted = extractor.extract(&block.merkle_block_message()).unwrap();
            assert_eq!(extracted.block_hash, block.hash());
            assert!(extracted.associated_transaction_hashes.is_empty());
        }
    }

    #[test]
    fn test_bad_bits_block_still_links() {
        let params = regtest_params();
        let chain = mine_chain_with_bad_bits(&params.checkpoint.header, 4, 9, 2);

        assert_eq!(chain[2].header.bits, 0x2000ffff);
        assert!(chain.iter().enumerate().all(|(i, b)| i == 2 || b.header.bits == REGTEST_BITS));
        assert_eq!(chain[3].header.previous_block_hash, chain[2].hash());
        assert!(check_proof_of_work(&chain[2].hash(), chain[2].header.bits).is_ok());
    }

    #[test]
    fn test_matched_transactions_are_proven() {
        let params = regtest_params();
        let chain = mine_chain_with_matches(&params.checkpoint.header, 4, 7, 2);
        let extractor = MerkleBlockExtractor::new(params.max_block_size);

        let extracted = extractor.extract(&chain[1].merkle_block_message()).unwrap();
        let expected: HashSet<Hash256> = chain[1].matched_transactions().iter().map(|t| t.hash).collect();
        assert_eq!(extracted.associated_transaction_hashes, expected);
        assert_eq!(expected.len(), 1);
    }
}
