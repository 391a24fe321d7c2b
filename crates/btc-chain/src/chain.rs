//! The full-pruned block chain engine.

use crate::{ChainError, ChainListener, ChainResult, OrphanPool};
use btc_core::{
    compact_from_target, count_sigops, target_from_compact, Block, NetworkParameters,
    ScriptVerifier, Sha256dHash, Transaction, VerificationError, MAX_BLOCK_SIGOPS,
};
use btc_store::{
    FullPrunedBlockStore, StoreError, StoredBlock, StoredTxOut, StoredUndoableBlock,
    TransactionOutputChanges,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Blocks may be at most this far ahead of our clock.
const MAX_FUTURE_DRIFT_SECS: u64 = 2 * 60 * 60;

/// Number of ancestor timestamps in the median-time-past window.
const TIMESTAMP_MEDIAN_WINDOW: usize = 11;

enum Outcome {
    /// Block already stored; nothing done.
    Duplicate,
    /// Parent unknown; buffered (or dropped if the buffer is full).
    Orphaned,
    /// Block stored. `connected` is true when it extended the best chain.
    Stored { hash: Sha256dHash, connected: bool },
}

/// Accepts blocks, validates consensus rules, maintains the UTXO set and
/// performs reorganizations via recorded undo data.
///
/// All `add` calls are serialized through an internal lock, so UTXO
/// mutation is linearizable and connect events fire in chain order.
pub struct FullPrunedBlockChain {
    params: Arc<NetworkParameters>,
    store: Arc<dyn FullPrunedBlockStore>,
    script_verifier: Arc<dyn ScriptVerifier>,
    orphans: Mutex<OrphanPool>,
    listeners: RwLock<Vec<Arc<dyn ChainListener>>>,
}

impl FullPrunedBlockChain {
    /// Create a chain over the given store and script oracle.
    pub fn new(
        params: Arc<NetworkParameters>,
        store: Arc<dyn FullPrunedBlockStore>,
        script_verifier: Arc<dyn ScriptVerifier>,
    ) -> Self {
        Self {
            params,
            store,
            script_verifier,
            orphans: Mutex::new(OrphanPool::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The network parameters in force.
    pub fn params(&self) -> &NetworkParameters {
        &self.params
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn FullPrunedBlockStore> {
        &self.store
    }

    /// Register a listener for chain events.
    pub fn add_listener(&self, listener: Arc<dyn ChainListener>) {
        self.listeners.write().push(listener);
    }

    /// The current best block.
    pub fn chain_head(&self) -> ChainResult<StoredBlock> {
        Ok(self.store.chain_head()?)
    }

    /// Height of the best chain.
    pub fn height(&self) -> ChainResult<u32> {
        Ok(self.store.chain_head()?.height)
    }

    /// True when the given block is waiting for its parent.
    pub fn is_orphan(&self, hash: &Sha256dHash) -> bool {
        self.orphans.lock().contains(hash)
    }

    /// Number of buffered orphans.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Accept a block.
    ///
    /// Returns `Ok(true)` when the block became part of the best chain
    /// (directly or via reorganization), `Ok(false)` when it was stored as
    /// a side branch, buffered as an orphan, or already known. On any
    /// verification error the store batch is aborted and chain state is
    /// untouched.
    pub fn add(&self, block: Block) -> ChainResult<bool> {
        let mut orphans = self.orphans.lock();
        let (hash, connected) = match self.process_block(&mut orphans, block)? {
            Outcome::Duplicate | Outcome::Orphaned => return Ok(false),
            Outcome::Stored { hash, connected } => (hash, connected),
        };

        // Re-process buffered descendants now that their ancestor landed.
        let mut queue = vec![hash];
        while let Some(parent) = queue.pop() {
            for child in orphans.take_children(&parent) {
                let child_hash = child.hash();
                match self.process_block(&mut orphans, child) {
                    Ok(Outcome::Stored { .. }) => queue.push(child_hash),
                    Ok(_) => {}
                    Err(ChainError::Store(e)) => return Err(ChainError::Store(e)),
                    Err(e) => {
                        warn!(block = %child_hash, error = %e, "Dropping invalid orphan")
                    }
                }
            }
        }

        Ok(connected)
    }

    fn process_block(&self, orphans: &mut OrphanPool, block: Block) -> ChainResult<Outcome> {
        let hash = block.hash();
        if self.store.get(&hash)?.is_some() {
            debug!(block = %hash, "Duplicate block ignored");
            return Ok(Outcome::Duplicate);
        }

        block.verify(&self.params)?;

        let parent = match self.store.get(&block.header().prev_hash)? {
            Some(parent) => parent,
            None => {
                debug!(block = %hash, parent = %block.header().prev_hash, "Buffering orphan");
                orphans.insert(block);
                return Ok(Outcome::Orphaned);
            }
        };

        self.check_context(&parent, &block)?;

        let candidate = parent.build_next(*block.header());
        let head = self.store.chain_head()?;

        if parent.hash() == head.hash() {
            self.connect_best(&candidate, &block)?;
            Ok(Outcome::Stored {
                hash,
                connected: true,
            })
        } else if candidate.chain_work > head.chain_work {
            self.reorganize(&head, &parent, &candidate, &block)?;
            Ok(Outcome::Stored {
                hash,
                connected: true,
            })
        } else {
            // Side branch: keep the transaction bodies so a later
            // reorganization can replay them.
            let undo = StoredUndoableBlock::new(
                hash,
                candidate.height,
                TransactionOutputChanges::new(),
                block.transactions().to_vec(),
            );
            self.store.put(candidate, undo)?;
            info!(block = %hash, "Stored side-branch block");
            Ok(Outcome::Stored {
                hash,
                connected: false,
            })
        }
    }

    /// Contextual validation against the parent chain: median-time-past,
    /// future drift, difficulty transitions, checkpoints.
    fn check_context(&self, parent: &StoredBlock, block: &Block) -> ChainResult<()> {
        let header = block.header();
        let height = parent.height + 1;

        // Median of the previous (up to) 11 block times.
        let mut times = Vec::with_capacity(TIMESTAMP_MEDIAN_WINDOW);
        let mut cursor = parent.clone();
        loop {
            times.push(cursor.header.time);
            if times.len() == TIMESTAMP_MEDIAN_WINDOW || cursor.height == 0 {
                break;
            }
            cursor = self.parent_of(&cursor)?;
        }
        times.sort_unstable();
        let median = times[times.len() / 2];
        if header.time <= median {
            return Err(VerificationError::BadTimestamp {
                block_time: header.time,
                limit: median,
            }
            .into());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let drift_limit = now + MAX_FUTURE_DRIFT_SECS;
        if header.time as u64 > drift_limit {
            return Err(VerificationError::BadTimestamp {
                block_time: header.time,
                limit: drift_limit as u32,
            }
            .into());
        }

        self.check_difficulty_transition(parent, header.bits, height)?;

        if let Some(required) = self.params.checkpoint_at(height) {
            let hash = block.hash();
            if hash != *required {
                return Err(VerificationError::CheckpointMismatch {
                    height,
                    got: hash.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    fn check_difficulty_transition(
        &self,
        parent: &StoredBlock,
        bits: u32,
        height: u32,
    ) -> ChainResult<()> {
        let interval = self.params.retarget_interval;
        if height % interval != 0 {
            if bits != parent.header.bits {
                return Err(VerificationError::BadDifficulty {
                    got: bits,
                    expected: parent.header.bits,
                }
                .into());
            }
            return Ok(());
        }

        // Walk back to the first block of the ending period.
        let mut cursor = parent.clone();
        for _ in 0..interval - 1 {
            cursor = self.parent_of(&cursor)?;
        }

        let target_timespan = self.params.target_timespan_secs;
        let actual = parent
            .header
            .time
            .saturating_sub(cursor.header.time)
            .clamp(target_timespan / 4, target_timespan * 4);

        let mut new_target = target_from_compact(parent.header.bits) * actual / target_timespan;
        if new_target > self.params.max_target {
            new_target = self.params.max_target.clone();
        }

        // Comparison happens at compact precision, like the target itself.
        let expected = compact_from_target(&new_target);
        if bits != expected {
            return Err(VerificationError::BadDifficulty {
                got: bits,
                expected,
            }
            .into());
        }
        Ok(())
    }

    /// Connect a block that extends the current head.
    fn connect_best(&self, candidate: &StoredBlock, block: &Block) -> ChainResult<()> {
        self.store.begin_batch()?;
        let result = (|| -> ChainResult<()> {
            let changes = self.connect_transactions(candidate.height, block.transactions())?;
            let undo = StoredUndoableBlock::new(
                candidate.hash(),
                candidate.height,
                changes,
                block.transactions().to_vec(),
            );
            self.store.put(candidate.clone(), undo)?;
            self.store.set_chain_head(candidate.clone())?;
            self.store.set_verified_chain_head(candidate.clone())?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.store.commit_batch()?;
                info!(
                    block = %candidate.hash(),
                    height = candidate.height,
                    "Connected block"
                );
                for listener in self.listeners.read().iter() {
                    listener.on_block_connected(block, candidate);
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.store.abort_batch();
                Err(e)
            }
        }
    }

    /// Validate and apply a block's transactions against the batch-visible
    /// UTXO state, returning the delta for undo.
    fn connect_transactions(
        &self,
        height: u32,
        transactions: &[Transaction],
    ) -> ChainResult<TransactionOutputChanges> {
        let mut sigops = 0usize;
        for tx in transactions {
            for input in tx.inputs() {
                sigops += count_sigops(&input.script_sig);
            }
            for output in tx.outputs() {
                sigops += count_sigops(&output.script_pubkey);
            }
        }
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(VerificationError::TooManySigOps {
                count: sigops,
                max: MAX_BLOCK_SIGOPS,
            }
            .into());
        }

        // An earlier transaction with the same hash must not still have
        // unspent outputs.
        for tx in transactions {
            let hash = tx.hash();
            if self
                .store
                .has_unspent_outputs(&hash, tx.outputs().len() as u32)?
            {
                return Err(VerificationError::DuplicateTransaction {
                    hash: hash.to_string(),
                }
                .into());
            }
        }

        let mut changes = TransactionOutputChanges::new();
        let mut fees: i64 = 0;

        for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            let tx_hash = tx.hash();
            let mut value_in: i64 = 0;

            for (input_index, input) in tx.inputs().iter().enumerate() {
                let prev = input.prev_out;
                let out = self
                    .store
                    .get_output(&prev.hash, prev.index)?
                    .ok_or(VerificationError::DoubleSpend {
                        hash: prev.hash.to_string(),
                        index: prev.index,
                    })?;

                if out.coinbase && height - out.height < self.params.spendable_coinbase_depth {
                    return Err(VerificationError::CoinbaseImmature {
                        created: out.height,
                        spent: height,
                    }
                    .into());
                }

                self.script_verifier
                    .verify(&input.script_sig, &out.script_pubkey, tx, input_index)
                    .map_err(|e| VerificationError::InvalidScript {
                        tx: tx_hash.to_string(),
                        input_index,
                        reason: e.reason,
                    })?;

                value_in += out.value;
                self.store.remove_unspent_output(&prev.hash, prev.index)?;
                changes.spent.push(out);
            }

            let value_out = tx.output_value();
            if value_out > value_in {
                return Err(VerificationError::InvalidTransaction(format!(
                    "outputs {value_out} exceed inputs {value_in} in {tx_hash}"
                ))
                .into());
            }
            fees += value_in - value_out;

            for (index, output) in tx.outputs().iter().enumerate() {
                let stored = StoredTxOut::new(
                    tx_hash,
                    index as u32,
                    output.value,
                    output.script_pubkey.clone(),
                    height,
                    false,
                );
                self.store.add_unspent_output(stored.clone())?;
                changes.created.push(stored);
            }
        }

        // The coinbase is processed last so collected fees bound its value.
        let coinbase = transactions
            .first()
            .filter(|tx| tx.is_coinbase())
            .ok_or_else(|| {
                VerificationError::InvalidBlock("first transaction is not a coinbase".to_string())
            })?;
        let ceiling = self.params.subsidy(height) + fees;
        if coinbase.output_value() > ceiling {
            return Err(VerificationError::ValueOverflow {
                value: coinbase.output_value(),
            }
            .into());
        }
        let coinbase_hash = coinbase.hash();
        for (index, output) in coinbase.outputs().iter().enumerate() {
            let stored = StoredTxOut::new(
                coinbase_hash,
                index as u32,
                output.value,
                output.script_pubkey.clone(),
                height,
                true,
            );
            self.store.add_unspent_output(stored.clone())?;
            changes.created.push(stored);
        }

        Ok(changes)
    }

    /// Switch the best chain onto the branch ending at `candidate`.
    fn reorganize(
        &self,
        head: &StoredBlock,
        parent: &StoredBlock,
        candidate: &StoredBlock,
        block: &Block,
    ) -> ChainResult<()> {
        // Walk both branches down to the common ancestor. `disconnect`
        // ends up newest-first, `connect` newest-first as well.
        let mut disconnect = Vec::new();
        let mut connect = Vec::new();
        let mut old_cursor = head.clone();
        let mut new_cursor = parent.clone();

        while old_cursor.height > new_cursor.height {
            disconnect.push(old_cursor.clone());
            old_cursor = self.parent_of(&old_cursor)?;
        }
        while new_cursor.height > old_cursor.height {
            connect.push(new_cursor.clone());
            new_cursor = self.parent_of(&new_cursor)?;
        }
        while old_cursor.hash() != new_cursor.hash() {
            disconnect.push(old_cursor.clone());
            old_cursor = self.parent_of(&old_cursor)?;
            connect.push(new_cursor.clone());
            new_cursor = self.parent_of(&new_cursor)?;
        }
        let fork = old_cursor;

        info!(
            fork = %fork.hash(),
            fork_height = fork.height,
            disconnecting = disconnect.len(),
            connecting = connect.len() + 1,
            new_head = %candidate.hash(),
            "Reorganizing chain"
        );

        self.store.begin_batch()?;
        let result = (|| -> ChainResult<()> {
            // Disconnect the stale branch, newest first, via undo data.
            for stale in &disconnect {
                let undo = self
                    .store
                    .get_undo(&stale.hash())?
                    .ok_or_else(|| ChainError::Pruned(stale.hash().to_string()))?;
                for created in &undo.tx_out_changes.created {
                    self.store
                        .remove_unspent_output(&created.hash, created.index)?;
                }
                for spent in &undo.tx_out_changes.spent {
                    self.store.add_unspent_output(spent.clone())?;
                }
            }

            // Reconnect the new branch, oldest first, with full validation
            // against the rebuilt UTXO state.
            for fresh in connect.iter().rev() {
                let undo = self
                    .store
                    .get_undo(&fresh.hash())?
                    .ok_or_else(|| ChainError::Pruned(fresh.hash().to_string()))?;
                let transactions = undo
                    .transactions
                    .clone()
                    .ok_or_else(|| ChainError::Pruned(fresh.hash().to_string()))?;
                let changes = self.connect_transactions(fresh.height, &transactions)?;
                self.store.put(
                    fresh.clone(),
                    StoredUndoableBlock::new(fresh.hash(), fresh.height, changes, transactions),
                )?;
            }

            let changes = self.connect_transactions(candidate.height, block.transactions())?;
            self.store.put(
                candidate.clone(),
                StoredUndoableBlock::new(
                    candidate.hash(),
                    candidate.height,
                    changes,
                    block.transactions().to_vec(),
                ),
            )?;
            self.store.set_chain_head(candidate.clone())?;
            self.store.set_verified_chain_head(candidate.clone())?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.store.commit_batch()?;
                for listener in self.listeners.read().iter() {
                    listener.on_reorganize(head, candidate);
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.store.abort_batch();
                warn!(candidate = %candidate.hash(), error = %e, "Reorganization aborted");
                Err(e)
            }
        }
    }

    fn parent_of(&self, block: &StoredBlock) -> ChainResult<StoredBlock> {
        self.store
            .get(&block.header.prev_hash)?
            .ok_or_else(|| {
                ChainError::Store(StoreError::Backend(format!(
                    "missing ancestor {} of {}",
                    block.header.prev_hash,
                    block.hash()
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_core::{AcceptAllScripts, BlockHeader, TxInput, TxOutput, COIN};
    use btc_store::MemoryFullPrunedBlockStore;

    fn new_chain() -> (FullPrunedBlockChain, Arc<NetworkParameters>) {
        let params = Arc::new(NetworkParameters::unit_tests());
        let store = Arc::new(MemoryFullPrunedBlockStore::new(&params, 10));
        let chain = FullPrunedBlockChain::new(params.clone(), store, Arc::new(AcceptAllScripts));
        (chain, params)
    }

    fn coinbase_for_height(height: u32, value: i64) -> Transaction {
        let mut script = vec![0x04];
        script.extend_from_slice(&height.to_le_bytes());
        let mut tx = Transaction::new();
        tx.add_input(TxInput::coinbase(script));
        tx.add_output(TxOutput::new(value, vec![0x51]));
        tx
    }

    fn next_block(params: &NetworkParameters, parent: &StoredBlock, extra: Vec<Transaction>) -> Block {
        let height = parent.height + 1;
        let fees = 0;
        let mut transactions = vec![coinbase_for_height(height, params.subsidy(height) + fees)];
        transactions.extend(extra);
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_hash: parent.hash(),
                merkle_root: Sha256dHash::ZERO,
                time: parent.header.time + 60,
                bits: parent.header.bits,
                nonce: height,
            },
            Vec::new(),
        );
        for tx in transactions {
            block.add_transaction(tx);
        }
        block
    }

    #[test]
    fn test_connect_sequence() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();

        let b1 = next_block(&params, &genesis, vec![]);
        assert!(chain.add(b1.clone()).unwrap());
        assert_eq!(chain.height().unwrap(), 1);
        assert_eq!(chain.chain_head().unwrap().hash(), b1.hash());

        let stored_b1 = chain.store().get(&b1.hash()).unwrap().unwrap();
        let b2 = next_block(&params, &stored_b1, vec![]);
        assert!(chain.add(b2).unwrap());
        assert_eq!(chain.height().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_returns_false() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let b1 = next_block(&params, &genesis, vec![]);
        assert!(chain.add(b1.clone()).unwrap());
        assert!(!chain.add(b1).unwrap());
        assert_eq!(chain.height().unwrap(), 1);
    }

    #[test]
    fn test_orphan_buffered_then_attached() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let b1 = next_block(&params, &genesis, vec![]);
        let stored_b1 = genesis.build_next(*b1.header());
        let b2 = next_block(&params, &stored_b1, vec![]);

        // Child arrives first: buffered, head unchanged.
        assert!(!chain.add(b2.clone()).unwrap());
        assert!(chain.is_orphan(&b2.hash()));
        assert_eq!(chain.height().unwrap(), 0);

        // Parent arrives: both attach.
        assert!(chain.add(b1).unwrap());
        assert_eq!(chain.height().unwrap(), 2);
        assert!(!chain.is_orphan(&b2.hash()));
        assert_eq!(chain.chain_head().unwrap().hash(), b2.hash());
    }

    #[test]
    fn test_wrong_bits_rejected() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let mut b1 = next_block(&params, &genesis, vec![]);
        // Still easy enough to pass PoW, but not the expected transition.
        b1.header_mut().bits = 0x2100_FFFF;
        let err = chain.add(b1).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Verification(VerificationError::BadDifficulty { .. })
        ));
        assert_eq!(chain.height().unwrap(), 0);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let mut b1 = next_block(&params, &genesis, vec![]);
        b1.header_mut().time = genesis.header.time;
        let err = chain.add(b1).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Verification(VerificationError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn test_oversized_coinbase_value_rejected() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_hash: genesis.hash(),
                merkle_root: Sha256dHash::ZERO,
                time: genesis.header.time + 60,
                bits: genesis.header.bits,
                nonce: 1,
            },
            Vec::new(),
        );
        block.add_transaction(coinbase_for_height(1, params.subsidy(1) + 1));
        let err = chain.add(block).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Verification(VerificationError::ValueOverflow { .. })
        ));
        // Chain state untouched.
        assert_eq!(chain.height().unwrap(), 0);
        assert_eq!(chain.store().live_undo_blocks(), 1);
    }

    #[test]
    fn test_spend_in_next_block() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let b1 = next_block(&params, &genesis, vec![]);
        let coinbase_hash = b1.transactions()[0].hash();
        assert!(chain.add(b1.clone()).unwrap());

        // Coinbase spend before maturity is rejected.
        let stored_b1 = chain.store().get(&b1.hash()).unwrap().unwrap();
        let mut spend = Transaction::new();
        spend.add_input(TxInput::new(
            btc_core::OutPoint::new(coinbase_hash, 0),
            vec![0x51],
        ));
        spend.add_output(TxOutput::new(50 * COIN, vec![0x51]));
        let b2 = next_block(&params, &stored_b1, vec![spend]);
        let err = chain.add(b2).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Verification(VerificationError::CoinbaseImmature { .. })
        ));
    }

    #[test]
    fn test_unknown_input_rejected_as_double_spend() {
        let (chain, params) = new_chain();
        let genesis = chain.chain_head().unwrap();
        let mut spend = Transaction::new();
        spend.add_input(TxInput::new(
            btc_core::OutPoint::new(Sha256dHash::hash(b"nonexistent"), 0),
            vec![0x51],
        ));
        spend.add_output(TxOutput::new(COIN, vec![0x51]));
        let b1 = next_block(&params, &genesis, vec![spend]);
        let err = chain.add(b1).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Verification(VerificationError::DoubleSpend { .. })
        ));
    }
}
