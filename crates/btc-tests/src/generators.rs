//! Deterministic test data generators.
//!
//! Blocks are built against unit-test parameters whose target admits every
//! hash, so no solving is needed and the whole suite is reproducible.

use btc_core::{
    Block, BlockHeader, NetworkParameters, OutPoint, Sha256dHash, Transaction, TxInput, TxOutput,
};
use btc_store::StoredBlock;
use std::sync::Arc;

/// Spacing between generated block timestamps.
const BLOCK_SPACING_SECS: u32 = 60;

/// Deterministic block builder.
pub struct BlockGenerator {
    params: Arc<NetworkParameters>,
}

impl BlockGenerator {
    /// Create a generator for the given parameters.
    pub fn new(params: Arc<NetworkParameters>) -> Self {
        Self { params }
    }

    /// A coinbase claiming the full subsidy plus `fees` at `height`.
    ///
    /// `branch` makes otherwise-identical coinbases on competing branches
    /// hash differently.
    pub fn coinbase(&self, height: u32, fees: i64, branch: u8) -> Transaction {
        let mut script = vec![0x04];
        script.extend_from_slice(&height.to_le_bytes());
        script.push(branch);
        let mut tx = Transaction::new();
        tx.add_input(TxInput::coinbase(script));
        tx.add_output(TxOutput::new(
            self.params.subsidy(height) + fees,
            vec![0x51],
        ));
        tx
    }

    /// A transaction spending `prev` into a single output of `value`.
    pub fn spend(&self, prev: OutPoint, value: i64) -> Transaction {
        let mut tx = Transaction::new();
        tx.add_input(TxInput::new(prev, vec![0x51]));
        tx.add_output(TxOutput::new(value, vec![0x51]));
        tx
    }

    /// Build the next block on `parent` containing `extra` transactions
    /// after the coinbase.
    pub fn next_block(&self, parent: &StoredBlock, extra: Vec<Transaction>) -> Block {
        self.next_block_on_branch(parent, extra, 0)
    }

    /// Like [`next_block`](Self::next_block) with a branch discriminator.
    pub fn next_block_on_branch(
        &self,
        parent: &StoredBlock,
        extra: Vec<Transaction>,
        branch: u8,
    ) -> Block {
        let height = parent.height + 1;
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_hash: parent.hash(),
                merkle_root: Sha256dHash::ZERO,
                time: parent.header.time + BLOCK_SPACING_SECS,
                bits: parent.header.bits,
                nonce: height,
            },
            Vec::new(),
        );
        block.add_transaction(self.coinbase(height, 0, branch));
        for tx in extra {
            block.add_transaction(tx);
        }
        block
    }

    /// The stored form a block will take once connected on `parent`.
    /// Lets tests compute expected heads without touching a chain.
    pub fn stored_form(&self, parent: &StoredBlock, block: &Block) -> StoredBlock {
        parent.build_next(*block.header())
    }
}

/// A block paired with the outcome adding it must produce, in the style of
/// a generated acceptance suite.
pub struct TaggedBlock {
    /// A name for failure messages.
    pub name: &'static str,
    /// The block to add.
    pub block: Block,
    /// Whether `add` must return true (block became part of the best chain).
    pub connects: bool,
    /// Whether `add` must fail with a verification error.
    pub throws: bool,
    /// Required chain head after the add.
    pub expected_head: Sha256dHash,
    /// Required chain height after the add.
    pub expected_height: u32,
}
