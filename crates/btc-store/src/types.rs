//! Stored block and UTXO entry types.

use btc_core::{BlockHeader, Sha256dHash, Transaction};
use num_bigint::BigUint;

/// A block header with its position in the chain.
///
/// `chain_work` is the cumulative expected hash count over all ancestors
/// including this block; the chain head is the stored block with the
/// greatest chain work, ties broken by first arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    /// The block header.
    pub header: BlockHeader,
    /// Cumulative work up to and including this block.
    pub chain_work: BigUint,
    /// Height above genesis.
    pub height: u32,
}

impl StoredBlock {
    /// Wrap a genesis header at height zero.
    pub fn genesis(header: BlockHeader) -> Self {
        Self {
            chain_work: header.work(),
            header,
            height: 0,
        }
    }

    /// Block identity.
    pub fn hash(&self) -> Sha256dHash {
        self.header.hash()
    }

    /// Build the stored form of a child block on top of this one.
    pub fn build_next(&self, header: BlockHeader) -> Self {
        Self {
            chain_work: &self.chain_work + header.work(),
            header,
            height: self.height + 1,
        }
    }

    /// True when this block has strictly more work than `other`.
    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chain_work > other.chain_work
    }
}

/// An unspent transaction output with the context needed to validate a
/// future spend of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTxOut {
    /// Hash of the creating transaction.
    pub hash: Sha256dHash,
    /// Output index within that transaction.
    pub index: u32,
    /// Value in satoshis.
    pub value: i64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
    /// Height of the block that created the output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub coinbase: bool,
}

impl StoredTxOut {
    /// Create an entry.
    pub fn new(
        hash: Sha256dHash,
        index: u32,
        value: i64,
        script_pubkey: Vec<u8>,
        height: u32,
        coinbase: bool,
    ) -> Self {
        Self {
            hash,
            index,
            value,
            script_pubkey,
            height,
            coinbase,
        }
    }

    /// The UTXO set key for this entry.
    pub fn key(&self) -> (Sha256dHash, u32) {
        (self.hash, self.index)
    }
}

/// The UTXO delta a connected block produced, sufficient to reverse it
/// without the original transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOutputChanges {
    /// Outputs the block consumed; restored on disconnect.
    pub spent: Vec<StoredTxOut>,
    /// Outputs the block created; deleted on disconnect.
    pub created: Vec<StoredTxOut>,
}

impl TransactionOutputChanges {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }
}

/// What an undo record currently holds.
///
/// Recent blocks keep their full transaction list; once a block falls out
/// of the reorg window it is finalized down to just the UTXO delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoContents {
    /// The full transaction bodies (recent blocks).
    FullTransactions(Vec<Transaction>),
    /// Only the UTXO delta (finalized blocks).
    TxOutChanges(TransactionOutputChanges),
}

/// Undo information for one block within the reorg window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUndoableBlock {
    /// Block identity.
    pub hash: Sha256dHash,
    /// Block height, used to decide finalization.
    pub height: u32,
    /// The UTXO delta; always present.
    pub tx_out_changes: TransactionOutputChanges,
    /// Full transaction bodies; dropped at finalization.
    pub transactions: Option<Vec<Transaction>>,
}

impl StoredUndoableBlock {
    /// Create an undo record still holding its full transactions.
    pub fn new(
        hash: Sha256dHash,
        height: u32,
        tx_out_changes: TransactionOutputChanges,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            hash,
            height,
            tx_out_changes,
            transactions: Some(transactions),
        }
    }

    /// True once the full transaction list has been discarded.
    pub fn is_finalized(&self) -> bool {
        self.transactions.is_none()
    }

    /// Drop the full transaction list, keeping only the UTXO delta.
    pub fn finalize(&mut self) {
        self.transactions = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_core::NetworkParameters;

    #[test]
    fn test_build_next_accumulates_work_and_height() {
        let params = NetworkParameters::unit_tests();
        let genesis = StoredBlock::genesis(*params.genesis.header());
        assert_eq!(genesis.height, 0);

        let mut child_header = *params.genesis.header();
        child_header.prev_hash = genesis.hash();
        let child = genesis.build_next(child_header);
        assert_eq!(child.height, 1);
        assert!(child.chain_work > genesis.chain_work);
        assert!(child.more_work_than(&genesis));
    }

    #[test]
    fn test_finalization_drops_transactions() {
        let params = NetworkParameters::unit_tests();
        let txs = params.genesis.transactions().to_vec();
        let mut undo = StoredUndoableBlock::new(
            params.genesis.hash(),
            0,
            TransactionOutputChanges::new(),
            txs,
        );
        assert!(!undo.is_finalized());
        undo.finalize();
        assert!(undo.is_finalized());
        assert!(undo.transactions.is_none());
    }
}
