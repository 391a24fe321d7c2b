//! Merkle tree over transaction hashes.

use crate::Sha256dHash;

/// Compute the Merkle root of an ordered list of transaction hashes.
///
/// At each level the last element is duplicated when the count is odd;
/// each parent is the double-SHA256 of the concatenated pair. A single
/// hash is its own root; an empty list yields the zero hash (such a block
/// is rejected elsewhere).
pub fn merkle_root(hashes: &[Sha256dHash]) -> Sha256dHash {
    if hashes.is_empty() {
        return Sha256dHash::ZERO;
    }
    let mut level: Vec<Sha256dHash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(left.as_bytes());
            data[32..].copy_from_slice(right.as_bytes());
            next.push(Sha256dHash::hash(&data));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_hash_is_root() {
        let h = Sha256dHash::hash(b"tx");
        assert_eq!(merkle_root(&[h]), h);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let a = Sha256dHash::hash(b"a");
        let b = Sha256dHash::hash(b"b");
        let c = Sha256dHash::hash(b"c");

        // Three leaves behave like [a, b, c, c].
        let root3 = merkle_root(&[a, b, c]);
        let root4 = merkle_root(&[a, b, c, c]);
        assert_eq!(root3, root4);
    }

    #[test]
    fn test_order_matters() {
        let a = Sha256dHash::hash(b"a");
        let b = Sha256dHash::hash(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn test_empty_is_zero() {
        assert!(merkle_root(&[]).is_zero());
    }
}
