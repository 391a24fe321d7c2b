//! Block headers and blocks.

use crate::{
    merkle_root, target_from_compact, write_var_int, NetworkParameters, ParseError, ParseResult,
    Sha256dHash, Transaction, VerificationError, VerificationResult, WireReader,
};
use bytes::{BufMut, Bytes};
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::HashSet;

/// Serialized block header size.
pub const HEADER_SIZE: usize = 80;

/// Upper bound on per-block transaction count accepted during parsing.
const MAX_TX_COUNT: u64 = 100_000;

/// The 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block format version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Sha256dHash,
    /// Merkle root over the block's transaction hashes.
    pub merkle_root: Sha256dHash,
    /// Block timestamp, seconds since the epoch.
    pub time: u32,
    /// Compact encoding of the proof-of-work target.
    pub bits: u32,
    /// Solution counter.
    pub nonce: u32,
}

impl BlockHeader {
    /// Write the 80-byte serialization.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.version);
        buf.put_slice(self.prev_hash.as_bytes());
        buf.put_slice(self.merkle_root.as_bytes());
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    /// Serialize to a fresh 80-byte vector.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.write(&mut buf);
        buf
    }

    /// Parse an 80-byte header.
    pub fn parse(r: &mut WireReader<'_>) -> ParseResult<Self> {
        Ok(Self {
            version: r.read_u32_le()?,
            prev_hash: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32_le()?,
            bits: r.read_u32_le()?,
            nonce: r.read_u32_le()?,
        })
    }

    /// Block identity: double-SHA256 of the 80 header bytes.
    pub fn hash(&self) -> Sha256dHash {
        Sha256dHash::hash(&self.serialize())
    }

    /// Expected work to produce this header.
    pub fn work(&self) -> BigUint {
        crate::block_work(self.bits)
    }

    /// Check the proof of work against this header's own target.
    pub fn check_pow(&self, max_target: &BigUint) -> VerificationResult<()> {
        let target = target_from_compact(self.bits);
        if target.is_zero() || &target > max_target {
            return Err(VerificationError::BadDifficulty {
                got: self.bits,
                expected: crate::compact_from_target(max_target),
            });
        }
        let hash = self.hash();
        if hash.to_biguint() > target {
            return Err(VerificationError::BadPow {
                hash: hash.to_string(),
            });
        }
        Ok(())
    }
}

/// A block: header plus ordered transactions.
///
/// Like [`Transaction`], a block parsed off the wire retains its original
/// bytes and serializes back to them bit-for-bit until mutated. Mutation is
/// only reachable through `&mut` accessors, each of which drops the block's
/// cache before handing out the reference, so a dirty child always has a
/// dirty parent.
#[derive(Debug, Clone)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
    cached: Option<Bytes>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.transactions == other.transactions
    }
}

impl Eq for Block {}

impl Block {
    /// Assemble a block from parts.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            cached: None,
        }
    }

    /// The block header.
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Mutable header access. Invalidates cached bytes.
    pub fn header_mut(&mut self) -> &mut BlockHeader {
        self.cached = None;
        &mut self.header
    }

    /// Transactions in order.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Mutable transaction access. Invalidates the block's cached bytes;
    /// the individual transactions invalidate their own caches when their
    /// mutators are used.
    pub fn transactions_mut(&mut self) -> &mut Vec<Transaction> {
        self.cached = None;
        &mut self.transactions
    }

    /// Append a transaction and refresh the header's Merkle root.
    pub fn add_transaction(&mut self, tx: Transaction) {
        self.cached = None;
        self.transactions.push(tx);
        self.header.merkle_root = self.compute_merkle_root();
    }

    /// Block identity.
    pub fn hash(&self) -> Sha256dHash {
        self.header.hash()
    }

    /// Merkle root over the current transaction list.
    pub fn compute_merkle_root(&self) -> Sha256dHash {
        let hashes: Vec<Sha256dHash> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&hashes)
    }

    /// Serialize, returning the original wire bytes when unmutated.
    pub fn serialize(&self) -> Bytes {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let mut buf = Vec::with_capacity(HEADER_SIZE + 9);
        self.header.write(&mut buf);
        write_var_int(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write(&mut buf);
        }
        Bytes::from(buf)
    }

    /// Parse a block, retaining the exact consumed slice of `src`.
    pub fn parse(r: &mut WireReader<'_>, src: &Bytes) -> ParseResult<Self> {
        let start = r.position();
        let header = BlockHeader::parse(r)?;

        let count_pos = r.position();
        let n_txs = r.read_var_int()?;
        if n_txs > MAX_TX_COUNT {
            return Err(ParseError::Oversized {
                offset: count_pos,
                size: n_txs as usize,
                max: MAX_TX_COUNT as usize,
            });
        }
        let mut transactions = Vec::with_capacity(n_txs.min(1024) as usize);
        for _ in 0..n_txs {
            transactions.push(Transaction::parse(r, src)?);
        }

        let cached = Some(src.slice(start..r.position()));
        Ok(Self {
            header,
            transactions,
            cached,
        })
    }

    /// Parse a complete buffer as one block; trailing bytes fail.
    pub fn from_wire(src: &Bytes) -> ParseResult<Self> {
        let mut r = WireReader::new(src);
        let block = Self::parse(&mut r, src)?;
        if !r.is_empty() {
            return Err(ParseError::Malformed {
                offset: r.position(),
                what: format!("{} trailing bytes after block", r.remaining()),
            });
        }
        Ok(block)
    }

    /// Context-free validation: proof of work, Merkle root, coinbase
    /// placement, per-transaction structure, and in-block hash uniqueness.
    pub fn verify(&self, params: &NetworkParameters) -> VerificationResult<()> {
        self.header.check_pow(&params.max_target)?;

        if self.transactions.is_empty() {
            return Err(VerificationError::InvalidBlock(
                "block has no transactions".to_string(),
            ));
        }
        if !self.transactions[0].is_coinbase() {
            return Err(VerificationError::InvalidBlock(
                "first transaction is not a coinbase".to_string(),
            ));
        }
        for tx in &self.transactions[1..] {
            if tx.is_coinbase() {
                return Err(VerificationError::InvalidBlock(
                    "coinbase after the first transaction".to_string(),
                ));
            }
        }

        let mut seen = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !seen.insert(tx.hash()) {
                return Err(VerificationError::DuplicateTransaction {
                    hash: tx.hash().to_string(),
                });
            }
        }

        let computed = self.compute_merkle_root();
        if computed != self.header.merkle_root {
            return Err(VerificationError::BadMerkleRoot {
                header: self.header.merkle_root.to_string(),
                computed: computed.to_string(),
            });
        }

        for tx in &self.transactions {
            tx.verify()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutPoint, TxInput, TxOutput, COIN};

    fn coinbase_tx(tag: u8) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxInput::coinbase(vec![0x01, tag]));
        tx.add_output(TxOutput::new(50 * COIN, vec![0x51]));
        tx
    }

    fn test_block() -> Block {
        let coinbase = coinbase_tx(1);
        let header = BlockHeader {
            version: 1,
            prev_hash: Sha256dHash::ZERO,
            merkle_root: coinbase.hash(),
            time: 1_296_688_602,
            bits: 0x2101_0000,
            nonce: 0,
        };
        Block::new(header, vec![coinbase])
    }

    #[test]
    fn test_roundtrip_preserves_bytes() {
        let block = test_block();
        let bytes = block.serialize();
        let parsed = Block::from_wire(&bytes).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.serialize(), bytes);
        assert_eq!(parsed.hash(), block.hash());
    }

    #[test]
    fn test_verify_ok_under_test_params() {
        let params = NetworkParameters::unit_tests();
        assert!(test_block().verify(&params).is_ok());
    }

    #[test]
    fn test_verify_rejects_merkle_mismatch() {
        let params = NetworkParameters::unit_tests();
        let mut block = test_block();
        block.header_mut().merkle_root = Sha256dHash::hash(b"wrong");
        assert!(matches!(
            block.verify(&params),
            Err(VerificationError::BadMerkleRoot { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_missing_coinbase() {
        let params = NetworkParameters::unit_tests();
        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(
            OutPoint::new(Sha256dHash::hash(b"prev"), 0),
            vec![0x51],
        ));
        tx.add_output(TxOutput::new(COIN, vec![0x51]));
        let header = BlockHeader {
            version: 1,
            prev_hash: Sha256dHash::ZERO,
            merkle_root: tx.hash(),
            time: 1_296_688_602,
            bits: 0x2101_0000,
            nonce: 0,
        };
        let block = Block::new(header, vec![tx]);
        assert!(matches!(
            block.verify(&params),
            Err(VerificationError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_verify_rejects_duplicate_tx() {
        let params = NetworkParameters::unit_tests();
        let coinbase = coinbase_tx(1);
        let spend = {
            let mut tx = Transaction::new();
            tx.add_input(TxInput::new(OutPoint::new(coinbase.hash(), 0), vec![0x51]));
            tx.add_output(TxOutput::new(COIN, vec![0x51]));
            tx
        };
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_hash: Sha256dHash::ZERO,
                merkle_root: Sha256dHash::ZERO,
                time: 1_296_688_602,
                bits: 0x2101_0000,
                nonce: 0,
            },
            vec![],
        );
        block.add_transaction(coinbase);
        block.add_transaction(spend.clone());
        block.add_transaction(spend);
        assert!(matches!(
            block.verify(&params),
            Err(VerificationError::DuplicateTransaction { .. })
        ));
    }

    #[test]
    fn test_lazy_parse_idempotence() {
        // Parsing and re-serializing without mutation must be bit-exact.
        let block = test_block();
        let bytes = block.serialize();
        let parsed = Block::from_wire(&bytes).unwrap();
        let _ = parsed.transactions();
        let _ = parsed.header();
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_block_cache_invalidation_via_header() {
        let block = test_block();
        let bytes = block.serialize();
        let mut parsed = Block::from_wire(&bytes).unwrap();
        parsed.header_mut().nonce += 1;
        assert_ne!(parsed.serialize(), bytes);
    }
}
