//! Double-SHA256 hashes and their numeric interpretation.

use crate::{ParseError, ParseResult};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::fmt;

/// A double-SHA256 hash.
///
/// Stored in internal (wire) byte order. Displayed in the conventional
/// reversed hex order used by block explorers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha256dHash([u8; 32]);

impl Sha256dHash {
    /// The all-zero hash, used as the previous-output reference of a
    /// coinbase input and as the genesis parent.
    pub const ZERO: Sha256dHash = Sha256dHash([0u8; 32]);

    /// Hash `data` with SHA256(SHA256(data)).
    pub fn hash(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        Sha256dHash(out)
    }

    /// Wrap raw wire-order bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Sha256dHash(bytes)
    }

    /// Wrap a wire-order byte slice. Fails unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() != 32 {
            return Err(ParseError::Malformed {
                offset: 0,
                what: format!("hash must be 32 bytes, got {}", bytes.len()),
            });
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Sha256dHash(out))
    }

    /// Parse from display-order (reversed) hex, as printed by explorers.
    pub fn from_hex(s: &str) -> ParseResult<Self> {
        let mut bytes = hex::decode(s).map_err(|_| ParseError::Malformed {
            offset: 0,
            what: format!("invalid hex hash: {s}"),
        })?;
        if bytes.len() != 32 {
            return Err(ParseError::Malformed {
                offset: 0,
                what: format!("hash must be 32 bytes, got {}", bytes.len()),
            });
        }
        bytes.reverse();
        Self::from_slice(&bytes)
    }

    /// Raw wire-order bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Interpret the hash as a little-endian 256-bit integer, the form
    /// compared against the proof-of-work target.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_le(&self.0)
    }

    /// True for the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Sha256dHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::Debug for Sha256dHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl AsRef<[u8]> for Sha256dHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_empty() {
        // sha256d("") is a well-known vector.
        let h = Sha256dHash::hash(b"");
        assert_eq!(
            h.to_string(),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let s = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let h = Sha256dHash::from_hex(s).unwrap();
        assert_eq!(h.to_string(), s);
    }

    #[test]
    fn test_zero() {
        assert!(Sha256dHash::ZERO.is_zero());
        assert!(!Sha256dHash::hash(b"x").is_zero());
    }

    #[test]
    fn test_numeric_interpretation() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        let h = Sha256dHash::from_bytes(bytes);
        assert_eq!(h.to_biguint(), BigUint::from(1u32));
    }
}
