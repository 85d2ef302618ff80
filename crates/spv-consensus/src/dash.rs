//! Dark Gravity Wave: per-block retarget from a running average of the
//! last `interval` targets.

use crate::block::Block;
use crate::compact::{decode_compact, encode_compact};
use crate::validation::{previous, BlockLookup, BlockValidator};
use crate::{ConsensusError, ConsensusResult};
use num_bigint::BigUint;

/// Dark Gravity Wave validator.
#[derive(Debug, Clone)]
pub struct DarkGravityWaveValidator {
    interval: u32,
    target_timespan: i64,
    max_target: BigUint,
    activation_height: u32,
}

impl DarkGravityWaveValidator {
    /// Create a validator averaging over `interval` blocks (24 on Dash),
    /// checking candidates from `activation_height` on.
    pub fn new(interval: u32, target_timespan: i64, max_target_bits: u32, activation_height: u32) -> Self {
        Self {
            interval,
            target_timespan,
            max_target: decode_compact(max_target_bits),
            activation_height,
        }
    }

    /// Expected `bits` for the child of `last`.
    pub fn expected_bits(&self, last: &Block, chain: &dyn BlockLookup) -> ConsensusResult<u32> {
        let mut average = decode_compact(last.bits());
        let mut timespan = 0i64;
        let mut cursor = previous(last, chain);

        for count in 2..=self.interval {
            let current = cursor.take().ok_or(ConsensusError::NoPreviousBlock)?;

            average = (average * BigUint::from(count) + decode_compact(current.bits()))
                / BigUint::from(count + 1);

            if count < self.interval {
                cursor = previous(&current, chain);
            } else {
                timespan = last.timestamp() - current.timestamp();
            }
        }

        let timespan = timespan.clamp(self.target_timespan / 3, self.target_timespan * 3);

        let mut target = average * BigUint::from(timespan as u64) / BigUint::from(self.target_timespan as u64);
        if target > self.max_target {
            target = self.max_target.clone();
        }

        Ok(encode_compact(&target))
    }
}

impl BlockValidator for DarkGravityWaveValidator {
    fn name(&self) -> &'static str {
        "dark-gravity-wave"
    }

    fn is_applicable(&self, candidate: &Block, _previous: &Block) -> bool {
        candidate.height >= self.activation_height
    }

    fn validate(&self, candidate: &Block, previous: &Block, chain: &dyn BlockLookup) -> ConsensusResult<()> {
        let expected = self.expected_bits(previous, chain)?;
        if expected != candidate.bits() {
            return Err(ConsensusError::NotEqualBits {
                got: candidate.bits(),
                expected,
            });
        }
        Ok(())
    }
}
