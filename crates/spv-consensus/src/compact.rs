//! Compact ("nBits") target encoding.
//!
//! The compact form is a base-256 floating point number: the high byte is the
//! size in bytes, the low three bytes are the mantissa. The sign bit
//! (0x00800000) is never produced by the encoder.

use num_bigint::BigUint;
use num_traits::Zero;

/// Decode compact bits into a target.
pub fn decode_compact(bits: u32) -> BigUint {
    let size = (bits >> 24) as usize;
    let word = bits & 0x007f_ffff;

    if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3))
    }
}

/// Encode a target into compact bits.
pub fn encode_compact(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let mut size = target.to_bytes_be().len() as u32;
    let mut compact: u32 = if size <= 3 {
        let low = target.iter_u32_digits().next().unwrap_or(0);
        low << (8 * (3 - size))
    } else {
        let shifted: BigUint = target >> (8 * (size - 3));
        shifted.iter_u32_digits().next().unwrap_or(0)
    };

    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | (size << 24)
}

/// Proof-of-work hash value: the header hash read as a little-endian integer.
pub fn hash_to_biguint(hash: &crate::Hash256) -> BigUint {
    BigUint::from_bytes_le(hash.as_bytes())
}

/// 2^256, the size of the hash space.
pub fn largest_hash() -> BigUint {
    BigUint::from(1u32) << 256
}
