//! Fixed-interval difficulty retargeting.
//!
//! Every `interval` blocks the target is rescaled by the time the previous
//! interval took, clamped to [¼, 4×] of the nominal timespan. Between
//! retarget heights `bits` must not change.

use crate::block::Block;
use crate::compact::{decode_compact, encode_compact};
use crate::validation::{ancestor, BlockLookup, BlockValidator};
use crate::{ConsensusError, ConsensusResult};
use num_bigint::BigUint;
use tracing::debug;

/// Candidate `bits` must equal the parent's `bits`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitsValidator;

impl BlockValidator for BitsValidator {
    fn name(&self) -> &'static str {
        "bits"
    }

    fn validate(&self, candidate: &Block, previous: &Block, _chain: &dyn BlockLookup) -> ConsensusResult<()> {
        if candidate.bits() != previous.bits() {
            return Err(ConsensusError::NotEqualBits {
                got: candidate.bits(),
                expected: previous.bits(),
            });
        }
        Ok(())
    }
}

/// Retarget at heights divisible by `interval`.
#[derive(Debug, Clone)]
pub struct LegacyRetargetValidator {
    interval: u32,
    target_timespan: i64,
    max_target: BigUint,
}

impl LegacyRetargetValidator {
    /// Create a validator.
    ///
    /// # Arguments
    /// * `interval` - Retarget interval in blocks (2016 on Bitcoin)
    /// * `target_timespan` - Nominal interval duration in seconds
    /// * `max_target_bits` - Easiest allowed target, compact-encoded
    pub fn new(interval: u32, target_timespan: i64, max_target_bits: u32) -> Self {
        Self {
            interval,
            target_timespan,
            max_target: decode_compact(max_target_bits),
        }
    }

    /// Expected `bits` for a retarget block, given its parent and the first
    /// block of the closing interval.
    pub fn retarget(&self, previous: &Block, interval_start: &Block) -> u32 {
        let timespan = (previous.timestamp() - interval_start.timestamp())
            .clamp(self.target_timespan / 4, self.target_timespan * 4);

        let mut target = decode_compact(previous.bits()) * BigUint::from(timespan as u64)
            / BigUint::from(self.target_timespan as u64);
        if target > self.max_target {
            target = self.max_target.clone();
        }

        encode_compact(&target)
    }
}

impl BlockValidator for LegacyRetargetValidator {
    fn name(&self) -> &'static str {
        "legacy-retarget"
    }

    fn is_applicable(&self, candidate: &Block, _previous: &Block) -> bool {
        candidate.height % self.interval == 0
    }

    fn validate(&self, candidate: &Block, previous: &Block, chain: &dyn BlockLookup) -> ConsensusResult<()> {
        // Height `candidate - interval`, reached by walking back from the parent.
        let interval_start = ancestor(previous, self.interval as usize - 1, chain)
            .ok_or(ConsensusError::NoCheckpointBlock)?;

        let expected = self.retarget(previous, &interval_start);
        debug!(
            height = candidate.height,
            expected_bits = expected,
            "Difficulty retarget"
        );

        if expected != candidate.bits() {
            return Err(ConsensusError::NotDifficultyTransitionEqualBits {
                got: candidate.bits(),
                expected,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::test_util::TestChain;
    use crate::validation::BlockValidatorChain;

    const MAX_BITS: u32 = 0x1d00ffff;
    const TIMESPAN: i64 = 14 * 24 * 60 * 60;

    fn retarget_chain(spacing: u32, bits: u32) -> TestChain {
        // First block sits at a retarget height, so the next one is 2016 later.
        let mut chain = TestChain::new(2016, 1_500_000_000, bits);
        chain.extend(2015, spacing, bits);
        chain
    }

    #[test]
    fn test_applicable_only_at_interval() {
        let validator = LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS);
        let chain = retarget_chain(600, 0x1b0404cb);
        let candidate = chain.next(600, 0x1b0404cb);
        assert_eq!(candidate.height, 4032);
        assert!(validator.is_applicable(&candidate, chain.tip()));

        let mut short = TestChain::new(1, 0, MAX_BITS);
        let off = short.push(600, MAX_BITS);
        assert!(!validator.is_applicable(&off, &short.blocks[0]));
    }

    #[test]
    fn test_nominal_timespan_keeps_target() {
        let validator = LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS);
        let bits = 0x1b0404cb;
        // 2015 gaps of 600s plus one are slightly short of two weeks.
        let chain = retarget_chain(600, bits);
        let previous = chain.tip().clone();
        let start = &chain.blocks[0];

        let expected = validator.retarget(&previous, start);
        let candidate = chain.next(600, expected);
        assert!(validator.validate(&candidate, &previous, &chain.index).is_ok());
    }

    #[test]
    fn test_fast_interval_is_clamped_to_quarter() {
        let validator = LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS);
        let bits = 0x1b0404cb;
        let chain = retarget_chain(1, bits);
        let previous = chain.tip().clone();

        let expected = validator.retarget(&previous, &chain.blocks[0]);
        let quarter = encode_compact(&(decode_compact(bits) / BigUint::from(4u32)));
        assert_eq!(expected, quarter);
    }

    #[test]
    fn test_target_capped_at_max() {
        let validator = LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS);
        let chain = retarget_chain(6000, MAX_BITS);
        let previous = chain.tip().clone();
        assert_eq!(validator.retarget(&previous, &chain.blocks[0]), MAX_BITS);
    }

    #[test]
    fn test_wrong_transition_bits() {
        let validator = LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS);
        let chain = retarget_chain(600, 0x1b0404cb);
        let previous = chain.tip().clone();
        let candidate = chain.next(600, 0x1b0404cb + 1);

        assert!(matches!(
            validator.validate(&candidate, &previous, &chain.index),
            Err(ConsensusError::NotDifficultyTransitionEqualBits { .. })
        ));
    }

    #[test]
    fn test_missing_interval_start() {
        let validator = LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS);
        let mut chain = TestChain::new(4000, 0, MAX_BITS);
        chain.extend(31, 600, MAX_BITS);
        let previous = chain.tip().clone();
        let candidate = chain.next(600, MAX_BITS);
        assert_eq!(candidate.height, 4032);

        assert_eq!(
            validator.validate(&candidate, &previous, &chain.index),
            Err(ConsensusError::NoCheckpointBlock)
        );
    }

    #[test]
    fn test_non_retarget_height_requires_same_bits() {
        let validators = BlockValidatorChain::new()
            .with_chained(Box::new(LegacyRetargetValidator::new(2016, TIMESPAN, MAX_BITS)))
            .with_chained(Box::new(BitsValidator));

        let mut chain = TestChain::new(100, 0, 0x1b0404cb);
        chain.extend(3, 600, 0x1b0404cb);
        let previous = chain.tip().clone();

        for bits in [0x1b0404ca, 0x1b0404cc, MAX_BITS] {
            let candidate = chain.next(600, bits);
            assert!(validators.validate(&candidate, &previous, &chain.index).is_err());
        }
        let candidate = chain.next(600, 0x1b0404cb);
        assert!(validators.validate(&candidate, &previous, &chain.index).is_ok());
    }
}
