//! Header validation through the blockchain and the public validators.

use crate::generators::{fake_transaction, mine_block, mine_chain, solve, REGTEST_BITS};
use crate::harness::SyncFixture;
use spv_consensus::bitcoin_cash::{DifficultyAdjustmentValidator, DAA_ACTIVATION_HEIGHT, DAA_WINDOW};
use spv_consensus::difficulty::LegacyRetargetValidator;
use spv_consensus::{
    check_proof_of_work, decode_compact, Block, BlockHeader, BlockValidator, ChainParams,
    Checkpoint, ConsensusError, Hash256, MerkleBlock,
};
use spv_storage::Storage;
use spv_sync::SyncError;
use std::collections::{HashMap, HashSet};

const BITCOIN_MAX_BITS: u32 = 0x1d00ffff;
const TWO_WEEKS: i64 = 14 * 24 * 60 * 60;

fn merkle(header: &BlockHeader) -> MerkleBlock {
    MerkleBlock::new(header.clone(), HashSet::new())
}

// ============================================================================
// Blockchain Connect
// ============================================================================

#[test]
fn test_connect_rejects_insufficient_work() {
    let fixture = SyncFixture::new();
    let mut header = mine_block(fixture.genesis(), vec![fake_transaction(1, 0)], vec![false]).header;
    while check_proof_of_work(&header.hash(), header.bits).is_ok() {
        header.nonce = header.nonce.wrapping_add(1);
    }

    let result = fixture.blockchain.connect(&merkle(&header));
    assert!(matches!(
        result,
        Err(SyncError::Consensus(ConsensusError::InvalidProofOfWork(_)))
    ));
    assert!(fixture.storage.block(&header.hash()).unwrap().is_none());
}

#[test]
fn test_connect_rejects_changed_bits() {
    let fixture = SyncFixture::new();
    let mut header = mine_block(fixture.genesis(), vec![fake_transaction(1, 0)], vec![false]).header;
    header.bits = 0x2000ffff;
    let header = solve(header);

    match fixture.blockchain.connect(&merkle(&header)) {
        Err(SyncError::Consensus(ConsensusError::NotEqualBits { got, expected })) => {
            assert_eq!(got, 0x2000ffff);
            assert_eq!(expected, REGTEST_BITS);
        }
        other => panic!("unexpected result: {:?}", other.map(|b| b.height)),
    }
}

#[test]
fn test_connect_requires_parent() {
    let fixture = SyncFixture::new();
    let chain = mine_chain(fixture.genesis(), 3, 1);

    assert!(matches!(
        fixture.blockchain.connect(&merkle(&chain[2].header)),
        Err(SyncError::NoPreviousBlock)
    ));
    for block in &chain {
        fixture.blockchain.connect(&merkle(&block.header)).unwrap();
    }
    assert_eq!(fixture.storage.last_block().unwrap().unwrap().height, 3);
}

// ============================================================================
// Difficulty Rules
// ============================================================================

/// Headers from a retarget height, `spacing` seconds apart, all at `bits`.
fn retarget_window(start_height: u32, count: usize, spacing: u32, bits: u32) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    let mut previous_hash = Hash256::ZERO;
    for i in 0..count {
        let header = BlockHeader {
            version: 1,
            previous_block_hash: previous_hash,
            merkle_root: Hash256::ZERO,
            timestamp: 1_500_000_000 + i as u32 * spacing,
            bits,
            nonce: i as u32,
        };
        let block = Block::new(header, start_height + i as u32);
        previous_hash = block.hash;
        blocks.push(block);
    }
    blocks
}

fn candidate_after(previous: &Block, bits: u32) -> Block {
    let header = BlockHeader {
        version: 1,
        previous_block_hash: previous.hash,
        merkle_root: Hash256::ZERO,
        timestamp: previous.header.timestamp + 600,
        bits,
        nonce: 0,
    };
    Block::with_parent(header, previous)
}

#[test]
fn test_fast_interval_raises_difficulty() {
    let validator = LegacyRetargetValidator::new(2016, TWO_WEEKS, BITCOIN_MAX_BITS);
    let bits = 0x1b0404cb;
    let window = retarget_window(2016, 2016, 300, bits);
    let lookup: HashMap<Hash256, Block> = window.iter().map(|b| (b.hash, b.clone())).collect();
    let tip = window.last().unwrap();

    let expected = validator.retarget(tip, &window[0]);
    assert!(decode_compact(expected) < decode_compact(bits));

    let candidate = candidate_after(tip, expected);
    assert_eq!(candidate.height, 4032);
    assert!(validator.is_applicable(&candidate, tip));
    validator.validate(&candidate, tip, &lookup).unwrap();

    let stale_bits = candidate_after(tip, bits);
    assert!(matches!(
        validator.validate(&stale_bits, tip, &lookup),
        Err(ConsensusError::NotDifficultyTransitionEqualBits { .. })
    ));
}

#[test]
fn test_retarget_needs_full_interval() {
    let validator = LegacyRetargetValidator::new(2016, TWO_WEEKS, BITCOIN_MAX_BITS);
    let window = retarget_window(2016, 2016, 600, 0x1b0404cb);
    // Drop the interval start so the walk back comes up short.
    let lookup: HashMap<Hash256, Block> = window[1..].iter().map(|b| (b.hash, b.clone())).collect();
    let tip = window.last().unwrap();

    let candidate = candidate_after(tip, 0x1b0404cb);
    assert_eq!(
        validator.validate(&candidate, tip, &lookup),
        Err(ConsensusError::NoCheckpointBlock)
    );
}

#[test]
fn test_validator_chain_order_per_network() {
    let bitcoin = ChainParams::bitcoin().unwrap().validator_chain();
    assert_eq!(bitcoin.chained_names(), vec!["legacy-retarget", "bits"]);

    let regtest = ChainParams::regtest().unwrap().validator_chain();
    assert_eq!(regtest.chained_names(), vec!["bits"]);
}

// ============================================================================
// Bitcoin Cash Above The Checkpoint
// ============================================================================

fn daa() -> DifficultyAdjustmentValidator {
    DifficultyAdjustmentValidator::new(600, DAA_ACTIVATION_HEIGHT)
}

#[test]
fn test_bch_preset_lacks_daa_window() {
    let params = ChainParams::bitcoin_cash().unwrap();
    assert_eq!(params.required_history(), DAA_WINDOW);
    assert_eq!(params.stored_history(), 1);

    let checkpoint = params.checkpoint.block();
    let mut blocks = vec![checkpoint.clone()];
    for _ in 0..10 {
        let next = candidate_after(blocks.last().unwrap(), checkpoint.bits());
        blocks.push(next);
    }
    let lookup: HashMap<Hash256, Block> = blocks.iter().map(|b| (b.hash, b.clone())).collect();
    let tip = blocks.last().unwrap();
    let candidate = candidate_after(tip, checkpoint.bits());

    let validator = daa();
    assert!(validator.is_applicable(&candidate, tip));
    let err = validator.validate(&candidate, tip, &lookup).unwrap_err();
    assert_eq!(err, ConsensusError::NoPreviousBlock);

    // Left queued for a later round, not dropped as invalid.
    let err = SyncError::Consensus(err);
    assert!(err.is_chain_invariant());
    assert!(!err.is_validation());
}

#[test]
fn test_bch_checkpoint_ancestors_fill_daa_window() {
    let bits = 0x18039165;
    let window = retarget_window(600_000, DAA_WINDOW, 600, bits);
    let (tip, ancestors) = window.split_last().unwrap();
    let checkpoint = Checkpoint {
        height: tip.height,
        header: tip.header.clone(),
        additional_blocks: Vec::new(),
    }
    .with_additional_blocks(ancestors.to_vec())
    .unwrap();
    let params = ChainParams::bitcoin_cash().unwrap().with_checkpoint(checkpoint);
    assert_eq!(params.stored_history(), params.required_history());

    let lookup: HashMap<Hash256, Block> = params
        .checkpoint
        .blocks()
        .into_iter()
        .map(|b| (b.hash, b))
        .collect();
    let validator = daa();
    let expected = validator.expected_bits(&window).unwrap();

    let candidate = candidate_after(tip, expected);
    validator.validate(&candidate, tip, &lookup).unwrap();
    assert!(matches!(
        validator.validate(&candidate_after(tip, expected + 1), tip, &lookup),
        Err(ConsensusError::NotEqualBits { .. })
    ));
}
