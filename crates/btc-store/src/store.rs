//! The pruned block store interface.

use crate::{StoreResult, StoredBlock, StoredTxOut, StoredUndoableBlock};
use btc_core::Sha256dHash;

/// A block store that keeps headers forever, undo data for the reorg
/// window, and the UTXO set for the best chain.
///
/// Implementations must uphold:
/// - ancestor closure: every stored block's parent chain down to genesis is
///   stored;
/// - batch atomicity: all mutations between [`begin_batch`] and
///   [`commit_batch`] land together, or none do after [`abort_batch`];
/// - finalization: once a block is buried deeper than the configured reorg
///   window its undo record keeps only the UTXO delta.
///
/// [`begin_batch`]: FullPrunedBlockStore::begin_batch
/// [`commit_batch`]: FullPrunedBlockStore::commit_batch
/// [`abort_batch`]: FullPrunedBlockStore::abort_batch
pub trait FullPrunedBlockStore: Send + Sync {
    /// Store a block together with its undo data.
    fn put(&self, block: StoredBlock, undo: StoredUndoableBlock) -> StoreResult<()>;

    /// Fetch a stored block by hash.
    fn get(&self, hash: &Sha256dHash) -> StoreResult<Option<StoredBlock>>;

    /// Fetch a block's undo data, if still within the reorg window.
    fn get_undo(&self, hash: &Sha256dHash) -> StoreResult<Option<StoredUndoableBlock>>;

    /// The current chain head.
    fn chain_head(&self) -> StoreResult<StoredBlock>;

    /// Replace the chain head.
    fn set_chain_head(&self, head: StoredBlock) -> StoreResult<()>;

    /// The head of the fully-verified chain (UTXO state matches it).
    fn verified_chain_head(&self) -> StoreResult<StoredBlock>;

    /// Replace the verified chain head.
    fn set_verified_chain_head(&self, head: StoredBlock) -> StoreResult<()>;

    /// Insert an unspent output.
    fn add_unspent_output(&self, out: StoredTxOut) -> StoreResult<()>;

    /// Remove an unspent output by key.
    fn remove_unspent_output(&self, hash: &Sha256dHash, index: u32) -> StoreResult<()>;

    /// Look up an unspent output by key.
    fn get_output(&self, hash: &Sha256dHash, index: u32) -> StoreResult<Option<StoredTxOut>>;

    /// True when any output of the given transaction is still unspent.
    /// Used for the duplicate-transaction rule.
    fn has_unspent_outputs(&self, hash: &Sha256dHash, num_outputs: u32) -> StoreResult<bool>;

    /// Start recording mutations into an atomic batch.
    fn begin_batch(&self) -> StoreResult<()>;

    /// Apply every mutation recorded since [`begin_batch`].
    ///
    /// [`begin_batch`]: FullPrunedBlockStore::begin_batch
    fn commit_batch(&self) -> StoreResult<()>;

    /// Discard every mutation recorded since [`begin_batch`].
    ///
    /// [`begin_batch`]: FullPrunedBlockStore::begin_batch
    fn abort_batch(&self) -> StoreResult<()>;

    /// Number of undo records still holding full transaction bodies.
    /// Decrements as blocks are finalized past the reorg window.
    fn live_undo_blocks(&self) -> usize;
}
