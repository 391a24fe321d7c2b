//! In-memory reference implementation of the pruned block store.

use crate::{
    FullPrunedBlockStore, StoreError, StoreResult, StoredBlock, StoredTxOut, StoredUndoableBlock,
};
use btc_core::{NetworkParameters, Sha256dHash};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tracing::debug;

/// A map with a single level of batch overlay.
///
/// Outside a batch, mutations apply directly. Inside one, they accumulate
/// in an overlay that `commit` merges and `abort` discards, giving the
/// all-or-nothing semantics the store contract requires.
struct TransactionalMap<K, V> {
    committed: HashMap<K, V>,
    staged: HashMap<K, V>,
    deleted: HashSet<K>,
    in_batch: bool,
}

impl<K: Eq + Hash + Clone, V: Clone> TransactionalMap<K, V> {
    fn new() -> Self {
        Self {
            committed: HashMap::new(),
            staged: HashMap::new(),
            deleted: HashSet::new(),
            in_batch: false,
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        if self.in_batch {
            if self.deleted.contains(key) {
                return None;
            }
            if let Some(v) = self.staged.get(key) {
                return Some(v);
            }
        }
        self.committed.get(key)
    }

    fn put(&mut self, key: K, value: V) {
        if self.in_batch {
            self.deleted.remove(&key);
            self.staged.insert(key, value);
        } else {
            self.committed.insert(key, value);
        }
    }

    fn remove(&mut self, key: &K) {
        if self.in_batch {
            self.staged.remove(key);
            self.deleted.insert(key.clone());
        } else {
            self.committed.remove(key);
        }
    }

    fn begin(&mut self) {
        self.in_batch = true;
    }

    fn commit(&mut self) {
        for key in self.deleted.drain() {
            self.committed.remove(&key);
        }
        for (key, value) in self.staged.drain() {
            self.committed.insert(key, value);
        }
        self.in_batch = false;
    }

    fn abort(&mut self) {
        self.staged.clear();
        self.deleted.clear();
        self.in_batch = false;
    }

    /// Iterate the effective entries (overlay applied).
    fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let overlay = self.in_batch;
        self.staged
            .iter()
            .chain(self.committed.iter().filter(move |(k, _)| {
                !overlay || (!self.staged.contains_key(*k) && !self.deleted.contains(*k))
            }))
    }

    /// Keys of effective entries matching a predicate.
    fn keys_where(&self, mut pred: impl FnMut(&V) -> bool) -> Vec<K> {
        self.iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// A single value with the same batch-overlay behavior.
struct TransactionalCell<V> {
    committed: Option<V>,
    staged: Option<Option<V>>,
    in_batch: bool,
}

impl<V: Clone> TransactionalCell<V> {
    fn new() -> Self {
        Self {
            committed: None,
            staged: None,
            in_batch: false,
        }
    }

    fn get(&self) -> Option<&V> {
        if self.in_batch {
            if let Some(staged) = &self.staged {
                return staged.as_ref();
            }
        }
        self.committed.as_ref()
    }

    fn set(&mut self, value: V) {
        if self.in_batch {
            self.staged = Some(Some(value));
        } else {
            self.committed = Some(value);
        }
    }

    fn begin(&mut self) {
        self.in_batch = true;
    }

    fn commit(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.committed = staged;
        }
        self.in_batch = false;
    }

    fn abort(&mut self) {
        self.staged = None;
        self.in_batch = false;
    }
}

struct Inner {
    blocks: TransactionalMap<Sha256dHash, StoredBlock>,
    undo: TransactionalMap<Sha256dHash, StoredUndoableBlock>,
    utxo: TransactionalMap<(Sha256dHash, u32), StoredTxOut>,
    chain_head: TransactionalCell<StoredBlock>,
    verified_head: TransactionalCell<StoredBlock>,
    in_batch: bool,
}

/// In-memory pruned block store.
///
/// Headers live forever; undo records are finalized down to their UTXO
/// delta once they fall `max_reorg_depth` blocks behind the latest stored
/// height, releasing the full transaction bodies.
pub struct MemoryFullPrunedBlockStore {
    inner: RwLock<Inner>,
    max_reorg_depth: u32,
}

impl MemoryFullPrunedBlockStore {
    /// Create a store seeded with the genesis block of `params`, keeping
    /// full undo data for the most recent `max_reorg_depth` blocks.
    pub fn new(params: &NetworkParameters, max_reorg_depth: u32) -> Self {
        let mut inner = Inner {
            blocks: TransactionalMap::new(),
            undo: TransactionalMap::new(),
            utxo: TransactionalMap::new(),
            chain_head: TransactionalCell::new(),
            verified_head: TransactionalCell::new(),
            in_batch: false,
        };

        // The genesis block is stored with empty undo data and its outputs
        // are not part of the UTXO set, matching the reference client.
        let genesis = StoredBlock::genesis(*params.genesis.header());
        let genesis_undo = StoredUndoableBlock::new(
            genesis.hash(),
            0,
            Default::default(),
            Vec::new(),
        );
        inner.blocks.put(genesis.hash(), genesis.clone());
        inner.undo.put(genesis.hash(), genesis_undo);
        inner.chain_head.set(genesis.clone());
        inner.verified_head.set(genesis);

        Self {
            inner: RwLock::new(inner),
            max_reorg_depth,
        }
    }

    /// The configured reorg window depth.
    pub fn max_reorg_depth(&self) -> u32 {
        self.max_reorg_depth
    }

    /// Number of unspent outputs currently stored.
    pub fn utxo_count(&self) -> usize {
        self.inner.read().utxo.iter().count()
    }
}

impl FullPrunedBlockStore for MemoryFullPrunedBlockStore {
    fn put(&self, block: StoredBlock, undo: StoredUndoableBlock) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let hash = block.hash();
        let parent = block.header.prev_hash;
        if !parent.is_zero() && inner.blocks.get(&parent).is_none() {
            return Err(StoreError::OrphanParent {
                block: hash.to_string(),
                parent: parent.to_string(),
            });
        }

        let height = block.height;
        inner.blocks.put(hash, block);
        inner.undo.put(hash, undo);

        // Finalize undo records that just fell out of the reorg window.
        if height >= self.max_reorg_depth {
            let threshold = height - self.max_reorg_depth;
            let stale = inner
                .undo
                .keys_where(|u| u.height <= threshold && u.transactions.is_some());
            for key in stale {
                if let Some(record) = inner.undo.get(&key) {
                    let mut finalized = record.clone();
                    finalized.finalize();
                    debug!(block = %key, height = finalized.height, "Finalized undo record");
                    inner.undo.put(key, finalized);
                }
            }
        }

        Ok(())
    }

    fn get(&self, hash: &Sha256dHash) -> StoreResult<Option<StoredBlock>> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn get_undo(&self, hash: &Sha256dHash) -> StoreResult<Option<StoredUndoableBlock>> {
        Ok(self.inner.read().undo.get(hash).cloned())
    }

    fn chain_head(&self) -> StoreResult<StoredBlock> {
        self.inner
            .read()
            .chain_head
            .get()
            .cloned()
            .ok_or(StoreError::NoChainHead)
    }

    fn set_chain_head(&self, head: StoredBlock) -> StoreResult<()> {
        self.inner.write().chain_head.set(head);
        Ok(())
    }

    fn verified_chain_head(&self) -> StoreResult<StoredBlock> {
        self.inner
            .read()
            .verified_head
            .get()
            .cloned()
            .ok_or(StoreError::NoChainHead)
    }

    fn set_verified_chain_head(&self, head: StoredBlock) -> StoreResult<()> {
        self.inner.write().verified_head.set(head);
        Ok(())
    }

    fn add_unspent_output(&self, out: StoredTxOut) -> StoreResult<()> {
        self.inner.write().utxo.put(out.key(), out);
        Ok(())
    }

    fn remove_unspent_output(&self, hash: &Sha256dHash, index: u32) -> StoreResult<()> {
        self.inner.write().utxo.remove(&(*hash, index));
        Ok(())
    }

    fn get_output(&self, hash: &Sha256dHash, index: u32) -> StoreResult<Option<StoredTxOut>> {
        Ok(self.inner.read().utxo.get(&(*hash, index)).cloned())
    }

    fn has_unspent_outputs(&self, hash: &Sha256dHash, num_outputs: u32) -> StoreResult<bool> {
        let inner = self.inner.read();
        Ok((0..num_outputs).any(|index| inner.utxo.get(&(*hash, index)).is_some()))
    }

    fn begin_batch(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.in_batch {
            return Err(StoreError::BatchInProgress);
        }
        inner.in_batch = true;
        inner.blocks.begin();
        inner.undo.begin();
        inner.utxo.begin();
        inner.chain_head.begin();
        inner.verified_head.begin();
        Ok(())
    }

    fn commit_batch(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if !inner.in_batch {
            return Err(StoreError::NoActiveBatch);
        }
        inner.in_batch = false;
        inner.blocks.commit();
        inner.undo.commit();
        inner.utxo.commit();
        inner.chain_head.commit();
        inner.verified_head.commit();
        Ok(())
    }

    fn abort_batch(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if !inner.in_batch {
            return Err(StoreError::NoActiveBatch);
        }
        inner.in_batch = false;
        inner.blocks.abort();
        inner.undo.abort();
        inner.utxo.abort();
        inner.chain_head.abort();
        inner.verified_head.abort();
        Ok(())
    }

    fn live_undo_blocks(&self) -> usize {
        self.inner
            .read()
            .undo
            .iter()
            .filter(|(_, u)| u.transactions.is_some())
            .count()
    }
}
