//! Chain event listeners.

use btc_core::Block;
use btc_store::StoredBlock;

/// Observer of chain state transitions.
///
/// Callbacks run on the thread that produced the event and must not block;
/// hand off to a queue for long work. Connect events arrive in chain order.
pub trait ChainListener: Send + Sync {
    /// A block was connected to the best chain.
    fn on_block_connected(&self, _block: &Block, _stored: &StoredBlock) {}

    /// The best chain switched branches.
    fn on_reorganize(&self, _old_head: &StoredBlock, _new_head: &StoredBlock) {}
}
