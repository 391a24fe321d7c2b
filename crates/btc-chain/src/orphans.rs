//! Buffer for blocks whose parents have not arrived yet.

use btc_core::{Block, Sha256dHash};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Default orphan buffer capacity.
pub const DEFAULT_ORPHAN_CAPACITY: usize = 50;

/// Bounded buffer of parentless blocks, keyed by the parent hash they are
/// waiting for. When the buffer is full, newly arriving orphans are
/// rejected rather than evicting buffered ones.
pub struct OrphanPool {
    by_parent: HashMap<Sha256dHash, Vec<Block>>,
    hashes: HashSet<Sha256dHash>,
    capacity: usize,
}

impl OrphanPool {
    /// Create a pool holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            by_parent: HashMap::new(),
            hashes: HashSet::new(),
            capacity,
        }
    }

    /// Number of buffered blocks.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// True when the given block hash is buffered.
    pub fn contains(&self, hash: &Sha256dHash) -> bool {
        self.hashes.contains(hash)
    }

    /// Buffer a block. Returns false when the block was dropped because
    /// the pool is full or the block is already present.
    pub fn insert(&mut self, block: Block) -> bool {
        let hash = block.hash();
        if self.hashes.contains(&hash) {
            return false;
        }
        if self.hashes.len() >= self.capacity {
            debug!(block = %hash, capacity = self.capacity, "Orphan buffer full, dropping block");
            return false;
        }
        self.hashes.insert(hash);
        self.by_parent
            .entry(block.header().prev_hash)
            .or_default()
            .push(block);
        true
    }

    /// Remove and return every buffered block waiting for `parent`.
    pub fn take_children(&mut self, parent: &Sha256dHash) -> Vec<Block> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        for child in &children {
            self.hashes.remove(&child.hash());
        }
        children
    }
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(DEFAULT_ORPHAN_CAPACITY)
    }
}
