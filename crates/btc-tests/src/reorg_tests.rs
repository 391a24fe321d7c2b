//! Reorganization behavior and UTXO consistency across branch switches.

use crate::TestChain;
use btc_chain::ChainListener;
use btc_core::Block;
use btc_store::{FullPrunedBlockStore, StoredBlock};
use std::sync::Mutex;

/// Build a six-block branch (heights 6..=11) off the stored block at
/// height five.
fn competing_branch(chain: &TestChain, fork: &StoredBlock) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut parent = fork.clone();
    for _ in 0..6 {
        let block = chain.generator.next_block_on_branch(&parent, vec![], 1);
        parent = chain.generator.stored_form(&parent, &block);
        blocks.push(block);
    }
    blocks
}

#[test]
fn test_reorg_to_heavier_branch() {
    let chain = TestChain::new();

    // Chain A: heights 1..=10.
    let a_blocks = chain.extend(10);
    assert_eq!(chain.height(), 10);

    // Chain B branches at height 5 and reaches height 11.
    let fork = chain.stored(&a_blocks[4].hash()).expect("fork point");
    let b_blocks = competing_branch(&chain, &fork);

    // B6..B10 have no more work than the head: stored as side branch.
    for block in &b_blocks[..5] {
        assert!(!chain.add(block.clone()).unwrap());
    }
    assert_eq!(chain.height(), 10);
    assert_eq!(chain.head().hash(), a_blocks[9].hash());

    // B11 exceeds the head's work and triggers the reorganization.
    assert!(chain.add(b_blocks[5].clone()).unwrap());
    assert_eq!(chain.height(), 11);
    assert_eq!(chain.head().hash(), b_blocks[5].hash());

    // Outputs exclusive to A6..A10 are gone.
    for stale in &a_blocks[5..] {
        let coinbase = stale.transactions()[0].hash();
        assert!(
            chain.store.get_output(&coinbase, 0).unwrap().is_none(),
            "stale output survived the reorg"
        );
    }
    // Outputs of every B block are present.
    for fresh in &b_blocks {
        let coinbase = fresh.transactions()[0].hash();
        assert!(
            chain.store.get_output(&coinbase, 0).unwrap().is_some(),
            "reorged-in output missing"
        );
    }
    // Shared history below the fork is untouched.
    for shared in &a_blocks[..5] {
        let coinbase = shared.transactions()[0].hash();
        assert!(chain.store.get_output(&coinbase, 0).unwrap().is_some());
    }
}

#[test]
fn test_reorg_matches_direct_replay() {
    // Adding A then switching to B must leave the same UTXO state as
    // adding the winning chain directly.
    let reorged = TestChain::new();
    let a_blocks = reorged.extend(10);
    let fork = reorged.stored(&a_blocks[4].hash()).expect("fork point");
    let b_blocks = competing_branch(&reorged, &fork);
    for block in &b_blocks {
        reorged.add(block.clone()).unwrap();
    }

    let direct = TestChain::new();
    for block in &a_blocks[..5] {
        direct.add(block.clone()).unwrap();
    }
    for block in &b_blocks {
        assert!(direct.add(block.clone()).unwrap());
    }

    assert_eq!(reorged.head().hash(), direct.head().hash());
    assert_eq!(reorged.height(), direct.height());
    assert_eq!(reorged.store.utxo_count(), direct.store.utxo_count());
    for block in a_blocks[..5].iter().chain(b_blocks.iter()) {
        let coinbase = block.transactions()[0].hash();
        assert_eq!(
            reorged.store.get_output(&coinbase, 0).unwrap(),
            direct.store.get_output(&coinbase, 0).unwrap()
        );
    }
}

#[derive(Default)]
struct RecordingListener {
    reorgs: Mutex<Vec<(u32, u32)>>,
    connected: Mutex<Vec<u32>>,
}

impl ChainListener for RecordingListener {
    fn on_block_connected(&self, _block: &Block, stored: &StoredBlock) {
        self.connected.lock().unwrap().push(stored.height);
    }

    fn on_reorganize(&self, old_head: &StoredBlock, new_head: &StoredBlock) {
        self.reorgs
            .lock()
            .unwrap()
            .push((old_head.height, new_head.height));
    }
}

#[test]
fn test_listeners_observe_connects_in_order_and_reorg() {
    let chain = TestChain::new();
    let listener = std::sync::Arc::new(RecordingListener::default());
    chain.chain.add_listener(listener.clone());

    let a_blocks = chain.extend(10);
    let fork = chain.stored(&a_blocks[4].hash()).expect("fork point");
    for block in competing_branch(&chain, &fork) {
        chain.add(block).unwrap();
    }

    // Connect events arrived in chain order.
    let connected = listener.connected.lock().unwrap().clone();
    assert_eq!(connected, (1..=10).collect::<Vec<u32>>());

    // One reorganization from the height-10 head to the height-11 head.
    let reorgs = listener.reorgs.lock().unwrap().clone();
    assert_eq!(reorgs, vec![(10, 11)]);
}

#[test]
fn test_failed_reorg_leaves_state_untouched() {
    let chain = TestChain::new();
    let a_blocks = chain.extend(3);
    let fork = chain.stored(&a_blocks[0].hash()).expect("fork point");

    // A competing branch whose final block overclaims its coinbase. The
    // branch gets heavier at height 4, but connecting it fails.
    let mut parent = fork.clone();
    let mut branch = Vec::new();
    for _ in 0..2 {
        let block = chain.generator.next_block_on_branch(&parent, vec![], 7);
        parent = chain.generator.stored_form(&parent, &block);
        branch.push(block);
    }
    let mut bad_tip = chain.generator.next_block_on_branch(&parent, vec![], 7);
    let greedy = chain.generator.coinbase(parent.height + 1, 1, 7);
    bad_tip.transactions_mut().clear();
    bad_tip.add_transaction(greedy);
    branch.push(bad_tip);

    for block in &branch[..2] {
        assert!(!chain.add(block.clone()).unwrap());
    }
    let head_before = chain.head();
    let utxo_before = chain.store.utxo_count();

    assert!(chain.add(branch[2].clone()).is_err());

    assert_eq!(chain.head().hash(), head_before.hash());
    assert_eq!(chain.store.utxo_count(), utxo_before);
}
