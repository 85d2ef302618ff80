//! Block validator chain.
//!
//! Every candidate is first linked to its parent and checked for proof of
//! work. The first applicable difficulty validator (in configured order)
//! then checks the candidate's `bits`.

use crate::block::Block;
use crate::compact::{decode_compact, hash_to_biguint};
use crate::hash::Hash256;
use crate::{ConsensusError, ConsensusResult};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Number of blocks in a median-time-past window.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Read access to already-stored blocks, keyed by header hash.
pub trait BlockLookup {
    /// Block with the given header hash.
    fn lookup_block(&self, hash: &Hash256) -> Option<Block>;
}

impl BlockLookup for HashMap<Hash256, Block> {
    fn lookup_block(&self, hash: &Hash256) -> Option<Block> {
        self.get(hash).cloned()
    }
}

/// A single difficulty or proof-of-work rule.
pub trait BlockValidator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this validator is responsible for `candidate`.
    fn is_applicable(&self, _candidate: &Block, _previous: &Block) -> bool {
        true
    }

    /// Check `candidate` given its parent `previous`.
    fn validate(
        &self,
        candidate: &Block,
        previous: &Block,
        chain: &dyn BlockLookup,
    ) -> ConsensusResult<()>;
}

/// Ordered validators resolved once from chain parameters.
#[derive(Default)]
pub struct BlockValidatorChain {
    always: Vec<Box<dyn BlockValidator>>,
    chained: Vec<Box<dyn BlockValidator>>,
}

impl BlockValidatorChain {
    /// Empty chain (linkage check only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator that runs for every candidate.
    pub fn with_always(mut self, validator: Box<dyn BlockValidator>) -> Self {
        self.always.push(validator);
        self
    }

    /// Add a validator to the chain of responsibility.
    pub fn with_chained(mut self, validator: Box<dyn BlockValidator>) -> Self {
        self.chained.push(validator);
        self
    }

    /// Names of the chained validators, in order.
    pub fn chained_names(&self) -> Vec<&'static str> {
        self.chained.iter().map(|v| v.name()).collect()
    }

    /// Validate `candidate` against `previous`.
    #[instrument(skip_all, fields(height = candidate.height))]
    pub fn validate(
        &self,
        candidate: &Block,
        previous: &Block,
        chain: &dyn BlockLookup,
    ) -> ConsensusResult<()> {
        if candidate.previous_hash() != &previous.hash {
            return Err(ConsensusError::WrongPreviousHeader);
        }

        for validator in &self.always {
            validator.validate(candidate, previous, chain)?;
        }

        if let Some(validator) = self
            .chained
            .iter()
            .find(|v| v.is_applicable(candidate, previous))
        {
            debug!(validator = validator.name(), "Validating difficulty");
            validator.validate(candidate, previous, chain)?;
        }

        Ok(())
    }
}

/// Header hash must be below the target encoded in `bits`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProofOfWorkValidator;

impl BlockValidator for ProofOfWorkValidator {
    fn name(&self) -> &'static str {
        "proof-of-work"
    }

    fn validate(&self, candidate: &Block, _previous: &Block, _chain: &dyn BlockLookup) -> ConsensusResult<()> {
        check_proof_of_work(&candidate.hash, candidate.bits())
    }
}

/// Check that `hash`, read as a little-endian integer, is below `bits`' target.
pub fn check_proof_of_work(hash: &Hash256, bits: u32) -> ConsensusResult<()> {
    let target = decode_compact(bits);
    if hash_to_biguint(hash) < target {
        Ok(())
    } else {
        Err(ConsensusError::InvalidProofOfWork(format!(
            "hash {} above target of bits {:#010x}",
            hash, bits
        )))
    }
}

/// Parent of `block`.
pub fn previous(block: &Block, chain: &dyn BlockLookup) -> Option<Block> {
    chain.lookup_block(block.previous_hash())
}

/// Ancestor `steps` blocks behind `block` (`steps == 0` returns `block`).
pub fn ancestor(block: &Block, steps: usize, chain: &dyn BlockLookup) -> Option<Block> {
    let mut current = block.clone();
    for _ in 0..steps {
        current = previous(&current, chain)?;
    }
    Some(current)
}

/// `count` consecutive blocks ending at `block`, oldest first.
pub fn previous_window(block: &Block, count: usize, chain: &dyn BlockLookup) -> Option<Vec<Block>> {
    if count == 0 {
        return Some(Vec::new());
    }

    let mut window = Vec::with_capacity(count);
    window.push(block.clone());
    while window.len() < count {
        let parent = previous(window.last()?, chain)?;
        window.push(parent);
    }
    window.reverse();
    Some(window)
}

/// Median timestamp of the 11 blocks ending at `block`, `None` if fewer exist.
pub fn median_time_past(block: &Block, chain: &dyn BlockLookup) -> Option<i64> {
    let window = previous_window(block, MEDIAN_TIME_SPAN, chain)?;
    let mut times: Vec<i64> = window.iter().map(|b| b.timestamp()).collect();
    times.sort_unstable();
    Some(times[MEDIAN_TIME_SPAN / 2])
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::block::BlockHeader;

    /// In-memory chain of blocks with chosen timestamps and bits.
    pub struct TestChain {
        pub blocks: Vec<Block>,
        pub index: HashMap<Hash256, Block>,
    }

    impl TestChain {
        pub fn new(start_height: u32, start_time: u32, bits: u32) -> Self {
            let header = BlockHeader {
                version: 1,
                previous_block_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp: start_time,
                bits,
                nonce: 0,
            };
            let block = Block::new(header, start_height);
            let mut index = HashMap::new();
            index.insert(block.hash, block.clone());
            Self {
                blocks: vec![block],
                index,
            }
        }

        pub fn tip(&self) -> &Block {
            &self.blocks[self.blocks.len() - 1]
        }

        /// Build (without storing) the next block.
        pub fn next(&self, spacing: u32, bits: u32) -> Block {
            let tip = self.tip();
            let header = BlockHeader {
                version: 1,
                previous_block_hash: tip.hash,
                merkle_root: Hash256::ZERO,
                timestamp: tip.header.timestamp + spacing,
                bits,
                nonce: self.blocks.len() as u32,
            };
            Block::with_parent(header, tip)
        }

        pub fn push(&mut self, spacing: u32, bits: u32) -> Block {
            let block = self.next(spacing, bits);
            self.index.insert(block.hash, block.clone());
            self.blocks.push(block.clone());
            block
        }

        pub fn extend(&mut self, count: usize, spacing: u32, bits: u32) {
            for _ in 0..count {
                self.push(spacing, bits);
            }
        }
    }
}
