//! Coinbase maturity enforcement.

use crate::TestChain;
use btc_chain::ChainError;
use btc_core::{OutPoint, VerificationError, COIN};
use btc_store::FullPrunedBlockStore;

#[test]
fn test_coinbase_spend_one_block_early_rejected() {
    let chain = TestChain::new();
    assert_eq!(chain.params.spendable_coinbase_depth, 100);

    // The coinbase to spend is created at height 1.
    let b1 = chain.extend(1).remove(0);
    let coinbase = b1.transactions()[0].hash();
    chain.extend(98); // height 99

    let spend = chain.generator.spend(OutPoint::new(coinbase, 0), 49 * COIN);

    // Spending at height 100 puts the coinbase at depth 99.
    let premature = chain.generator.next_block(&chain.head(), vec![spend.clone()]);
    let err = chain.add(premature).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Verification(VerificationError::CoinbaseImmature {
            created: 1,
            spent: 100,
        })
    ));
    assert_eq!(chain.height(), 99);
    assert!(chain.store.get_output(&coinbase, 0).unwrap().is_some());

    // One block later the coinbase reaches depth 100 and the spend lands.
    chain.extend(1); // height 100
    let spend_hash = spend.hash();
    let mature = chain.generator.next_block(&chain.head(), vec![spend]);
    assert!(chain.add(mature).unwrap());
    assert_eq!(chain.height(), 101);
    assert!(chain.store.get_output(&coinbase, 0).unwrap().is_none());
    assert!(chain.store.get_output(&spend_hash, 0).unwrap().is_some());
}

#[test]
fn test_maturity_depth_is_a_parameter() {
    use btc_core::NetworkParameters;

    let chain = TestChain::with_params(
        NetworkParameters::unit_tests().with_spendable_coinbase_depth(2),
        10,
    );
    let b1 = chain.extend(1).remove(0);
    let coinbase = b1.transactions()[0].hash();
    chain.extend(1); // height 2

    let spend = chain.generator.spend(OutPoint::new(coinbase, 0), 49 * COIN);
    // Depth 2 at height 3: exactly mature.
    let block = chain.generator.next_block(&chain.head(), vec![spend]);
    assert!(chain.add(block).unwrap());
}
