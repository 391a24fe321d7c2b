//! Generated-chain acceptance suite: every block carries the outcome its
//! `add` must produce, and the head is checked after each step.

use crate::{BlockGenerator, TaggedBlock, TestChain};
use btc_chain::ChainError;
use btc_core::{NetworkParameters, OutPoint, COIN};
use btc_store::{FullPrunedBlockStore, StoredBlock};

/// Build the tagged suite. Coinbase maturity is lowered to one block so
/// early spends are legal where the tags say they are.
fn build_suite(chain: &TestChain) -> Vec<TaggedBlock> {
    let generator = &chain.generator;
    let genesis = chain.head();
    let mut suite = Vec::new();

    // Two plain extension blocks.
    let b1 = generator.next_block(&genesis, vec![]);
    let s1 = generator.stored_form(&genesis, &b1);
    let b1_coinbase = b1.transactions()[0].hash();
    suite.push(TaggedBlock {
        name: "b1",
        block: b1,
        connects: true,
        throws: false,
        expected_head: s1.hash(),
        expected_height: 1,
    });

    let b2 = generator.next_block(&s1, vec![]);
    let s2 = generator.stored_form(&s1, &b2);
    suite.push(TaggedBlock {
        name: "b2",
        block: b2,
        connects: true,
        throws: false,
        expected_head: s2.hash(),
        expected_height: 2,
    });

    // Same transaction twice in one block: rejected, head unchanged.
    let spend = generator.spend(OutPoint::new(b1_coinbase, 0), 49 * COIN);
    let duplicate_tx = generator.next_block(&s2, vec![spend.clone(), spend.clone()]);
    suite.push(TaggedBlock {
        name: "b3-duplicate-tx",
        block: duplicate_tx,
        connects: false,
        throws: true,
        expected_head: s2.hash(),
        expected_height: 2,
    });

    // Two different transactions spending the same output: rejected.
    let conflicting = generator.spend(OutPoint::new(b1_coinbase, 0), 48 * COIN);
    let double_spend = generator.next_block(&s2, vec![spend.clone(), conflicting]);
    suite.push(TaggedBlock {
        name: "b3-double-spend",
        block: double_spend,
        connects: false,
        throws: true,
        expected_head: s2.hash(),
        expected_height: 2,
    });

    // The same spend alone is fine.
    let b3 = generator.next_block(&s2, vec![spend]);
    let s3 = generator.stored_form(&s2, &b3);
    suite.push(TaggedBlock {
        name: "b3",
        block: b3,
        connects: true,
        throws: false,
        expected_head: s3.hash(),
        expected_height: 3,
    });

    // Equal-work competitor at the same height: stored, head unchanged.
    let side = generator.next_block_on_branch(&s2, vec![], 1);
    suite.push(TaggedBlock {
        name: "b3-side",
        block: side,
        connects: false,
        throws: false,
        expected_head: s3.hash(),
        expected_height: 3,
    });

    // Coinbase claiming more than subsidy plus fees: rejected.
    let greedy = {
        let mut block = generator.next_block(&s3, vec![]);
        let bonus = generator.coinbase(4, 1, 2);
        block.transactions_mut().clear();
        block.add_transaction(bonus);
        block
    };
    suite.push(TaggedBlock {
        name: "b4-overclaim",
        block: greedy,
        connects: false,
        throws: true,
        expected_head: s3.hash(),
        expected_height: 3,
    });

    // Recovery: a normal block still extends the chain.
    let b4 = generator.next_block(&s3, vec![]);
    let s4 = generator.stored_form(&s3, &b4);
    suite.push(TaggedBlock {
        name: "b4",
        block: b4,
        connects: true,
        throws: false,
        expected_head: s4.hash(),
        expected_height: 4,
    });

    suite
}

#[test]
fn test_generated_chain() {
    let chain = TestChain::with_params(
        NetworkParameters::unit_tests().with_spendable_coinbase_depth(1),
        10,
    );

    for tagged in build_suite(&chain) {
        let result = chain.add(tagged.block.clone());
        match result {
            Ok(connected) => {
                assert!(
                    !tagged.throws,
                    "block {} should have thrown, connected={connected}",
                    tagged.name
                );
                assert_eq!(
                    connected, tagged.connects,
                    "block {} connects flag mismatch",
                    tagged.name
                );
            }
            Err(ChainError::Verification(e)) => {
                assert!(
                    tagged.throws,
                    "block {} threw unexpectedly: {e}",
                    tagged.name
                );
                assert!(
                    !tagged.connects,
                    "block {} cannot both throw and connect",
                    tagged.name
                );
            }
            Err(e) => panic!("block {} hit a non-verification error: {e}", tagged.name),
        }

        let head = chain.head();
        assert_eq!(
            head.hash(),
            tagged.expected_head,
            "head mismatch after block {}",
            tagged.name
        );
        assert_eq!(
            head.height, tagged.expected_height,
            "height mismatch after block {}",
            tagged.name
        );
    }
}

#[test]
fn test_utxo_tracks_connected_blocks() {
    let chain = TestChain::with_params(
        NetworkParameters::unit_tests().with_spendable_coinbase_depth(1),
        10,
    );
    let generator = BlockGenerator::new(chain.params.clone());

    let genesis = chain.head();
    let b1 = generator.next_block(&genesis, vec![]);
    let b1_coinbase = b1.transactions()[0].hash();
    chain.add(b1).unwrap();
    assert!(chain.store.get_output(&b1_coinbase, 0).unwrap().is_some());

    let s1 = chain.head();
    let spend = generator.spend(OutPoint::new(b1_coinbase, 0), 49 * COIN);
    let spend_hash = spend.hash();
    let b2 = generator.next_block(&s1, vec![spend]);
    chain.add(b2).unwrap();

    // Spent output gone, replacement present: UTXO(B2) is UTXO(B1) minus
    // inputs plus outputs.
    assert!(chain.store.get_output(&b1_coinbase, 0).unwrap().is_none());
    assert!(chain.store.get_output(&spend_hash, 0).unwrap().is_some());
}

#[test]
fn test_long_chain_replay() {
    // A loader-shaped run: a long generated chain replayed into a chain
    // with a small reorg window must end on the expected head.
    let chain = TestChain::with_params(NetworkParameters::unit_tests(), 10);
    let generator = BlockGenerator::new(chain.params.clone());

    let mut expected: StoredBlock = chain.head();
    let mut blocks = Vec::new();
    for _ in 0..500 {
        let block = generator.next_block(&expected, vec![]);
        expected = generator.stored_form(&expected, &block);
        blocks.push(block);
    }

    for block in blocks {
        assert!(chain.add(block).unwrap());
    }

    assert_eq!(chain.height(), 500);
    assert_eq!(chain.head().hash(), expected.hash());
    // Deep history is finalized, the recent window is not.
    assert_eq!(chain.store.live_undo_blocks(), 10);
}
