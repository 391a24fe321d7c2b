//! # btc-chain
//!
//! The consensus engine. [`FullPrunedBlockChain`] accepts blocks, maintains
//! the UTXO set against the best chain, buffers orphans, and reorganizes
//! onto heavier branches using recorded undo data. All mutation is
//! serialized through a single writer lock; listeners observe connects and
//! reorganizations in chain order.

mod chain;
mod error;
mod listener;
mod orphans;

pub use chain::FullPrunedBlockChain;
pub use error::{ChainError, ChainResult};
pub use listener::ChainListener;
pub use orphans::OrphanPool;
