//! Partial Merkle trees for `merkleblock` messages.
//!
//! A filtered block carries the header, the total transaction count, a
//! depth-first list of subtree hashes and a bit flag per visited node.
//! The traversal descends only into subtrees containing a matched
//! transaction; everything else is summarized by its subtree hash.

use crate::{MerkleBlockMessage, ProtocolError};
use btc_core::{Block, ParseError, Sha256dHash, Transaction};

fn hash_pair(left: &Sha256dHash, right: &Sha256dHash) -> Sha256dHash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Sha256dHash::hash(&data)
}

/// Nodes at `height` when the leaf row has `total` entries.
fn row_width(total: u32, height: u32) -> u32 {
    (total + (1 << height) - 1) >> height
}

/// Height of the tree root.
fn tree_height(total: u32) -> u32 {
    let mut height = 0;
    while row_width(total, height) > 1 {
        height += 1;
    }
    height
}

struct Builder<'a> {
    txids: &'a [Sha256dHash],
    matched: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<Sha256dHash>,
}

impl Builder<'_> {
    fn subtree_hash(&self, height: u32, pos: u32) -> Sha256dHash {
        if height == 0 {
            return self.txids[pos as usize];
        }
        let left = self.subtree_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < row_width(self.txids.len() as u32, height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        hash_pair(&left, &right)
    }

    fn build(&mut self, height: u32, pos: u32) {
        let start = (pos as usize) << height;
        let end = (((pos + 1) as usize) << height).min(self.txids.len());
        let parent_of_match = self.matched[start..end].iter().any(|m| *m);
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            self.hashes.push(self.subtree_hash(height, pos));
        } else {
            self.build(height - 1, pos * 2);
            if pos * 2 + 1 < row_width(self.txids.len() as u32, height - 1) {
                self.build(height - 1, pos * 2 + 1);
            }
        }
    }
}

struct Extractor<'a> {
    total: u32,
    hashes: &'a [Sha256dHash],
    flags: &'a [u8],
    bits_used: usize,
    hashes_used: usize,
    matches: Vec<Sha256dHash>,
}

impl Extractor<'_> {
    fn next_bit(&mut self) -> Result<bool, ParseError> {
        if self.bits_used >= self.flags.len() * 8 {
            return Err(ParseError::Malformed {
                offset: self.bits_used / 8,
                what: "partial merkle tree ran out of flag bits".to_string(),
            });
        }
        let bit = self.flags[self.bits_used >> 3] >> (self.bits_used & 7) & 1 == 1;
        self.bits_used += 1;
        Ok(bit)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<Sha256dHash, ParseError> {
        let parent_of_match = self.next_bit()?;

        if height == 0 || !parent_of_match {
            if self.hashes_used >= self.hashes.len() {
                return Err(ParseError::Malformed {
                    offset: self.hashes_used,
                    what: "partial merkle tree ran out of hashes".to_string(),
                });
            }
            let hash = self.hashes[self.hashes_used];
            self.hashes_used += 1;
            if height == 0 && parent_of_match {
                self.matches.push(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < row_width(self.total, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            if right == left {
                // Duplicated nodes would let an attacker fake the width.
                return Err(ParseError::Malformed {
                    offset: self.hashes_used,
                    what: "duplicate hash in partial merkle tree".to_string(),
                });
            }
            right
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }
}

impl MerkleBlockMessage {
    /// Build a filtered block: the header plus a proof covering every
    /// transaction `is_match` selects.
    pub fn from_block(block: &Block, is_match: impl Fn(&Transaction) -> bool) -> Self {
        let txids: Vec<Sha256dHash> = block.transactions().iter().map(|tx| tx.hash()).collect();
        let matched: Vec<bool> = block.transactions().iter().map(is_match).collect();

        let mut builder = Builder {
            txids: &txids,
            matched: &matched,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        builder.build(tree_height(txids.len() as u32), 0);

        let mut flags = vec![0u8; builder.bits.len().div_ceil(8)];
        for (i, bit) in builder.bits.iter().enumerate() {
            if *bit {
                flags[i >> 3] |= 1 << (i & 7);
            }
        }

        Self {
            header: *block.header(),
            total_transactions: txids.len() as u32,
            hashes: builder.hashes,
            flags,
        }
    }

    /// Validate the proof against the header's Merkle root and return the
    /// matched transaction hashes in block order.
    pub fn extract_matches(&self) -> Result<Vec<Sha256dHash>, ProtocolError> {
        let malformed = |what: &str| {
            ProtocolError::BadPayload {
                command: "merkleblock".to_string(),
                source: ParseError::Malformed {
                    offset: 0,
                    what: what.to_string(),
                },
            }
        };

        if self.total_transactions == 0 {
            return Err(malformed("empty partial merkle tree"));
        }

        let mut extractor = Extractor {
            total: self.total_transactions,
            hashes: &self.hashes,
            flags: &self.flags,
            bits_used: 0,
            hashes_used: 0,
            matches: Vec::new(),
        };
        let root = extractor
            .traverse(tree_height(self.total_transactions), 0)
            .map_err(|source| ProtocolError::BadPayload {
                command: "merkleblock".to_string(),
                source,
            })?;

        if extractor.hashes_used != self.hashes.len() {
            return Err(malformed("unconsumed hashes in partial merkle tree"));
        }
        if root != self.header.merkle_root {
            return Err(malformed("partial merkle tree root mismatch"));
        }

        Ok(extractor.matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_core::{BlockHeader, OutPoint, TxInput, TxOutput};

    fn tx(tag: u8) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(
            OutPoint::new(Sha256dHash::hash(&[tag]), 0),
            vec![0x51],
        ));
        tx.add_output(TxOutput::new(tag as i64, vec![0x51]));
        tx
    }

    fn coinbase() -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxInput::coinbase(vec![0x01, 0x00]));
        tx.add_output(TxOutput::new(50, vec![0x51]));
        tx
    }

    fn block_with(transactions: Vec<Transaction>) -> Block {
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_hash: Sha256dHash::ZERO,
                merkle_root: Sha256dHash::ZERO,
                time: 1_296_688_602,
                bits: 0x2101_0000,
                nonce: 0,
            },
            Vec::new(),
        );
        for tx in transactions {
            block.add_transaction(tx);
        }
        block
    }

    #[test]
    fn test_single_match_extracted() {
        let target = tx(2);
        let target_hash = target.hash();
        let block = block_with(vec![coinbase(), tx(1), target, tx(3)]);

        let message = MerkleBlockMessage::from_block(&block, |t| t.hash() == target_hash);
        let matches = message.extract_matches().unwrap();
        assert_eq!(matches, vec![target_hash]);
    }

    #[test]
    fn test_all_and_none_matched() {
        let block = block_with(vec![coinbase(), tx(1), tx(2)]);
        let all_hashes: Vec<Sha256dHash> =
            block.transactions().iter().map(|t| t.hash()).collect();

        let all = MerkleBlockMessage::from_block(&block, |_| true);
        assert_eq!(all.extract_matches().unwrap(), all_hashes);

        let none = MerkleBlockMessage::from_block(&block, |_| false);
        assert!(none.extract_matches().unwrap().is_empty());
        // The whole tree collapses to the root hash.
        assert_eq!(none.hashes.len(), 1);
        assert_eq!(none.hashes[0], block.header().merkle_root);
    }

    #[test]
    fn test_odd_leaf_count() {
        let block = block_with(vec![coinbase(), tx(1), tx(2), tx(3), tx(4)]);
        let target = block.transactions()[4].hash();
        let message = MerkleBlockMessage::from_block(&block, |t| t.hash() == target);
        assert_eq!(message.extract_matches().unwrap(), vec![target]);
    }

    #[test]
    fn test_tampered_proof_rejected() {
        let block = block_with(vec![coinbase(), tx(1)]);
        let target = block.transactions()[1].hash();
        let mut message = MerkleBlockMessage::from_block(&block, |t| t.hash() == target);
        message.hashes[0] = Sha256dHash::hash(b"forged");
        assert!(message.extract_matches().is_err());
    }

    #[test]
    fn test_roundtrip_through_wire() {
        use crate::Message;
        use bytes::Bytes;

        let block = block_with(vec![coinbase(), tx(1), tx(2)]);
        let target = block.transactions()[1].hash();
        let message = MerkleBlockMessage::from_block(&block, |t| t.hash() == target);

        let payload = Bytes::from(Message::MerkleBlock(message.clone()).encode_payload());
        let parsed = Message::parse_payload("merkleblock", &payload).unwrap();
        let Message::MerkleBlock(parsed) = parsed else {
            panic!("wrong message kind");
        };
        assert_eq!(parsed, message);
        assert_eq!(parsed.extract_matches().unwrap(), vec![target]);
    }
}
