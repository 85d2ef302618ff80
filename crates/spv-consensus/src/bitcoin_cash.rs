//! Bitcoin Cash difficulty rules: emergency adjustment (EDA) and the
//! per-block averaging algorithm (DAA) that replaced it.

use crate::block::Block;
use crate::compact::{decode_compact, encode_compact, largest_hash};
use crate::validation::{ancestor, median_time_past, previous_window, BlockLookup, BlockValidator};
use crate::{ConsensusError, ConsensusResult};
use num_bigint::BigUint;
use num_traits::One;
use tracing::trace;

/// Height after which the DAA applies (parent height, mainnet).
pub const DAA_ACTIVATION_HEIGHT: u32 = 504_031;

/// Twelve hours of median-time-past without progress triggers the EDA.
const EDA_TRIGGER_SECS: i64 = 12 * 3600;

/// Blocks considered by the DAA, ending at the parent.
pub const DAA_WINDOW: usize = 147;

/// Emergency difficulty adjustment.
#[derive(Debug, Clone)]
pub struct EmergencyDifficultyValidator {
    max_target_bits: u32,
}

impl EmergencyDifficultyValidator {
    /// Create a validator with the chain's easiest `bits`.
    pub fn new(max_target_bits: u32) -> Self {
        Self { max_target_bits }
    }

    fn median_time_or_height(block: &Block, chain: &dyn BlockLookup) -> i64 {
        median_time_past(block, chain).unwrap_or(block.height as i64)
    }
}

impl BlockValidator for EmergencyDifficultyValidator {
    fn name(&self) -> &'static str {
        "eda"
    }

    fn validate(&self, candidate: &Block, previous: &Block, chain: &dyn BlockLookup) -> ConsensusResult<()> {
        if previous.bits() == self.max_target_bits {
            if candidate.bits() != self.max_target_bits {
                return Err(ConsensusError::NotEqualBits {
                    got: candidate.bits(),
                    expected: self.max_target_bits,
                });
            }
            return Ok(());
        }

        let cursor = ancestor(previous, 6, chain).ok_or(ConsensusError::NoPreviousBlock)?;
        let elapsed = Self::median_time_or_height(previous, chain)
            - Self::median_time_or_height(&cursor, chain);

        let expected = if elapsed >= EDA_TRIGGER_SECS {
            let target = decode_compact(previous.bits());
            let relaxed = &target + (&target >> 2);
            encode_compact(&relaxed).min(self.max_target_bits)
        } else {
            previous.bits()
        };

        if expected != candidate.bits() {
            return Err(ConsensusError::NotEqualBits {
                got: candidate.bits(),
                expected,
            });
        }
        Ok(())
    }
}

/// Per-block difficulty averaging over the last ~144 blocks.
#[derive(Debug, Clone)]
pub struct DifficultyAdjustmentValidator {
    target_spacing: i64,
    activation_height: u32,
}

impl DifficultyAdjustmentValidator {
    /// Create a validator for the given block spacing in seconds.
    pub fn new(target_spacing: i64, activation_height: u32) -> Self {
        Self {
            target_spacing,
            activation_height,
        }
    }

    /// Expected `bits` for the child of the last block in `chunk`.
    pub fn expected_bits(&self, chunk: &[Block]) -> ConsensusResult<u32> {
        if chunk.len() < 6 {
            return Err(ConsensusError::NoPreviousBlock);
        }

        let first = suitable_block(&chunk[0..3]);
        let last = suitable_block(&chunk[chunk.len() - 3..]);

        let height_interval = last.height.saturating_sub(first.height) as usize;
        let timespan = (last.timestamp() - first.timestamp())
            .clamp(72 * self.target_spacing, 288 * self.target_spacing);

        let last_index = chunk
            .iter()
            .position(|b| b.hash == last.hash)
            .ok_or(ConsensusError::NoPreviousBlock)?;
        let start = (last_index + 1)
            .checked_sub(height_interval)
            .ok_or(ConsensusError::NoPreviousBlock)?;

        let largest = largest_hash();
        let mut work = BigUint::default();
        for block in chunk[start..last_index].iter().chain(std::iter::once(&last)) {
            work += &largest / (decode_compact(block.bits()) + BigUint::one());
        }

        work = work * BigUint::from(self.target_spacing as u64) / BigUint::from(timespan as u64);
        if work == BigUint::default() {
            return Err(ConsensusError::NoPreviousBlock);
        }

        let target = &largest / work - BigUint::one();
        Ok(encode_compact(&target))
    }
}

impl BlockValidator for DifficultyAdjustmentValidator {
    fn name(&self) -> &'static str {
        "daa"
    }

    fn is_applicable(&self, _candidate: &Block, previous: &Block) -> bool {
        previous.height >= self.activation_height
    }

    fn validate(&self, candidate: &Block, previous: &Block, chain: &dyn BlockLookup) -> ConsensusResult<()> {
        let Some(chunk) = previous_window(previous, DAA_WINDOW, chain) else {
            trace!(height = candidate.height, "DAA window unavailable");
            return Err(ConsensusError::NoPreviousBlock);
        };

        let expected = self.expected_bits(&chunk)?;
        if expected != candidate.bits() {
            return Err(ConsensusError::NotEqualBits {
                got: candidate.bits(),
                expected,
            });
        }
        Ok(())
    }
}

/// Median of three blocks by timestamp.
fn suitable_block(blocks: &[Block]) -> Block {
    let mut sorted = [blocks[0].clone(), blocks[1].clone(), blocks[2].clone()];
    if sorted[0].timestamp() > sorted[2].timestamp() {
        sorted.swap(0, 2);
    }
    if sorted[0].timestamp() > sorted[1].timestamp() {
        sorted.swap(0, 1);
    }
    if sorted[1].timestamp() > sorted[2].timestamp() {
        sorted.swap(1, 2);
    }
    sorted[1].clone()
}
