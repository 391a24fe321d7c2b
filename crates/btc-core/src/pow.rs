//! Compact difficulty encoding and chain-work arithmetic.

use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Decode the compact `bits` representation into a 256-bit target.
///
/// The compact form packs a big-endian mantissa of up to three bytes with a
/// size byte: `target = mantissa * 256^(size - 3)`. The sign bit of the
/// mantissa is masked off; a set sign bit yields a zero target, which no
/// hash can satisfy.
pub fn target_from_compact(bits: u32) -> BigUint {
    let size = (bits >> 24) as usize;
    let word = bits & 0x007F_FFFF;
    if bits & 0x0080_0000 != 0 {
        return BigUint::zero();
    }
    if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3))
    }
}

/// Encode a target back into compact `bits` form.
pub fn compact_from_target(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut size = bytes.len();
    let mut word: u32 = 0;
    for &b in bytes.iter().take(3) {
        word = (word << 8) | b as u32;
    }
    if size < 3 {
        word <<= 8 * (3 - size);
    }
    // The mantissa sign bit must stay clear; shift into the size byte.
    if word & 0x0080_0000 != 0 {
        word >>= 8;
        size += 1;
    }
    word | ((size as u32) << 24)
}

/// Expected work to produce one block at the given difficulty:
/// `2^256 / (target + 1)`.
pub fn block_work(bits: u32) -> BigUint {
    let target = target_from_compact(bits);
    (BigUint::one() << 256u32) / (target + BigUint::one())
}
