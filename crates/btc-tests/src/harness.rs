//! Test harness: assembled chain, store and generator fixtures.

use crate::BlockGenerator;
use btc_chain::{ChainResult, FullPrunedBlockChain};
use btc_core::{AcceptAllScripts, Block, NetworkParameters, Sha256dHash};
use btc_store::{FullPrunedBlockStore, MemoryFullPrunedBlockStore, StoredBlock};
use std::sync::Arc;

/// A chain over an in-memory store with the accept-all script oracle.
pub struct TestChain {
    /// Parameters in force.
    pub params: Arc<NetworkParameters>,
    /// The concrete store, for UTXO and undo inspection.
    pub store: Arc<MemoryFullPrunedBlockStore>,
    /// The chain under test.
    pub chain: Arc<FullPrunedBlockChain>,
    /// Block builder bound to the same parameters.
    pub generator: BlockGenerator,
}

impl TestChain {
    /// Unit-test parameters with a reorg window of ten blocks.
    pub fn new() -> Self {
        Self::with_params(NetworkParameters::unit_tests(), 10)
    }

    /// Bespoke parameters and reorg window.
    pub fn with_params(params: NetworkParameters, max_reorg_depth: u32) -> Self {
        let params = Arc::new(params);
        let store = Arc::new(MemoryFullPrunedBlockStore::new(&params, max_reorg_depth));
        let store_dyn: Arc<dyn FullPrunedBlockStore> = store.clone();
        let chain = Arc::new(FullPrunedBlockChain::new(
            params.clone(),
            store_dyn,
            Arc::new(AcceptAllScripts),
        ));
        let generator = BlockGenerator::new(params.clone());
        Self {
            params,
            store,
            chain,
            generator,
        }
    }

    /// Current chain head.
    pub fn head(&self) -> StoredBlock {
        self.chain.chain_head().expect("chain head")
    }

    /// Current height.
    pub fn height(&self) -> u32 {
        self.head().height
    }

    /// Add a block.
    pub fn add(&self, block: Block) -> ChainResult<bool> {
        self.chain.add(block)
    }

    /// Fetch a stored block.
    pub fn stored(&self, hash: &Sha256dHash) -> Option<StoredBlock> {
        self.store.get(hash).expect("store get")
    }

    /// Extend the best chain with `count` empty blocks, returning them.
    pub fn extend(&self, count: u32) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let block = self.generator.next_block(&self.head(), vec![]);
            assert!(self.add(block.clone()).expect("extend add"), "extension block must connect");
            blocks.push(block);
        }
        blocks
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_starts_at_genesis() {
        let harness = TestChain::new();
        assert_eq!(harness.height(), 0);
        assert_eq!(harness.head().hash(), harness.params.genesis.hash());
    }

    #[test]
    fn test_extend_advances_head() {
        let harness = TestChain::new();
        let blocks = harness.extend(3);
        assert_eq!(harness.height(), 3);
        assert_eq!(harness.head().hash(), blocks[2].hash());
    }
}
