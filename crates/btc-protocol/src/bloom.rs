//! BIP37 bloom filters.
//!
//! Light clients install a filter with `filterload`; matching peers then
//! relay only relevant transactions and `merkleblock` proofs. The filter
//! uses 32-bit murmur3 with per-function seeds `i * 0xFBA4C795 + tweak`.

use crate::FilterLoadMessage;
use btc_core::Sha256dHash;

/// Hard cap on the serialized filter size.
const MAX_FILTER_BYTES: usize = 36_000;

/// Hard cap on the number of hash functions.
const MAX_HASH_FUNCS: u32 = 50;

/// 32-bit murmur3.
fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xCC9E_2D51;
    const C2: u32 = 0x1B87_3593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xE654_6B64);
    }

    let mut k1 = 0u32;
    for (i, &b) in tail.iter().enumerate() {
        k1 ^= (b as u32) << (8 * i);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85EB_CA6B);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xC2B2_AE35);
    h1 ^= h1 >> 16;
    h1
}

/// A bloom filter over arbitrary byte elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Size a filter for `elements` insertions at the given false-positive
    /// rate. The tweak randomizes the hash family; flags control matched-
    /// output insertion on the serving side.
    pub fn new(elements: usize, false_positive_rate: f64, tweak: u32, flags: u8) -> Self {
        let elements = elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;

        let bits = -elements * false_positive_rate.ln() / (ln2 * ln2);
        let bytes = ((bits / 8.0) as usize).clamp(1, MAX_FILTER_BYTES);

        let funcs = ((bytes * 8) as f64 / elements * ln2) as u32;
        let hash_funcs = funcs.clamp(1, MAX_HASH_FUNCS);

        Self {
            data: vec![0u8; bytes],
            hash_funcs,
            tweak,
            flags,
        }
    }

    /// Rebuild a filter from a received `filterload` payload.
    pub fn from_message(message: &FilterLoadMessage) -> Self {
        Self {
            data: message.filter.clone(),
            hash_funcs: message.hash_funcs.min(MAX_HASH_FUNCS),
            tweak: message.tweak,
            flags: message.flags,
        }
    }

    /// The `filterload` payload installing this filter.
    pub fn to_message(&self) -> FilterLoadMessage {
        FilterLoadMessage {
            filter: self.data.clone(),
            hash_funcs: self.hash_funcs,
            tweak: self.tweak,
            flags: self.flags,
        }
    }

    fn bit_index(&self, function: u32, element: &[u8]) -> usize {
        let seed = function
            .wrapping_mul(0xFBA4_C795)
            .wrapping_add(self.tweak);
        (murmur3_32(seed, element) as usize) % (self.data.len() * 8)
    }

    /// Insert an element.
    pub fn insert(&mut self, element: &[u8]) {
        for function in 0..self.hash_funcs {
            let index = self.bit_index(function, element);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    /// Insert a hash in wire byte order.
    pub fn insert_hash(&mut self, hash: &Sha256dHash) {
        self.insert(hash.as_bytes());
    }

    /// True when the element may have been inserted (false positives
    /// possible, false negatives not).
    pub fn contains(&self, element: &[u8]) -> bool {
        (0..self.hash_funcs).all(|function| {
            let index = self.bit_index(function, element);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    /// Membership test for a hash in wire byte order.
    pub fn contains_hash(&self, hash: &Sha256dHash) -> bool {
        self.contains(hash.as_bytes())
    }
}
