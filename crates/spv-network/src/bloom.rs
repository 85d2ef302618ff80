//! BIP37 bloom filter.
//!
//! Peers that support bloom filtering only relay merkle blocks and
//! transactions matching the loaded filter.

use crate::message::FilterLoadMessage;
use std::f64::consts::LN_2;
use std::io::Cursor;

/// Largest filter in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;

/// Largest number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Default false-positive rate.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.00005;

/// `nFlags` value: the peer never updates the filter.
pub const UPDATE_NONE: u8 = 0;

const SEED_MULTIPLIER: u32 = 0xFBA4C795;

/// Probabilistic set of watched elements.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Create a filter sized for `element_count` elements.
    pub fn with_capacity(element_count: usize, false_positive_rate: f64, tweak: u32) -> Self {
        let n = element_count.max(1) as f64;
        let bits = (-1.0 / (LN_2 * LN_2) * n * false_positive_rate.ln())
            .min((MAX_FILTER_SIZE * 8) as f64);
        let size = ((bits / 8.0) as usize).max(1);
        let hash_funcs = ((size * 8) as f64 / n * LN_2).min(MAX_HASH_FUNCS as f64) as u32;

        Self {
            data: vec![0u8; size],
            hash_funcs: hash_funcs.max(1),
            tweak,
            flags: UPDATE_NONE,
        }
    }

    /// Create a filter containing `elements`.
    pub fn new<I, E>(elements: I, false_positive_rate: f64, tweak: u32) -> Self
    where
        I: IntoIterator<Item = E>,
        I::IntoIter: ExactSizeIterator,
        E: AsRef<[u8]>,
    {
        let elements = elements.into_iter();
        let mut filter = Self::with_capacity(elements.len(), false_positive_rate, tweak);
        for element in elements {
            filter.insert(element.as_ref());
        }
        filter
    }

    fn bit_index(&self, function: u32, element: &[u8]) -> usize {
        let seed = function.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        let hash = murmur3::murmur3_32(&mut Cursor::new(element), seed).unwrap_or(0);
        hash as usize % (self.data.len() * 8)
    }

    /// Add an element.
    pub fn insert(&mut self, element: &[u8]) {
        for function in 0..self.hash_funcs {
            let index = self.bit_index(function, element);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    /// Whether the element may be in the set.
    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|function| {
            let index = self.bit_index(function, element);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    /// Filter bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of hash functions.
    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    /// `filterload` message for this filter.
    pub fn to_message(&self) -> FilterLoadMessage {
        FilterLoadMessage {
            filter: self.data.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }

    /// Serialized `filterload` payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        crate::message::put_var_int(&mut buf, self.data.len() as u64);
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.hash_funcs.to_le_bytes());
        buf.extend_from_slice(&self.tweak.to_le_bytes());
        buf.extend_from_slice(&[self.flags]);
        buf.to_vec()
    }
}

impl PartialEq for BloomFilter {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for BloomFilter {}
