//! Chain engine errors.

use btc_core::VerificationError;
use btc_store::StoreError;
use thiserror::Error;

/// Errors surfaced by [`crate::FullPrunedBlockChain::add`].
///
/// Verification failures reject the block and leave chain state untouched.
/// Store failures are fatal to further block acceptance.
#[derive(Error, Debug)]
pub enum ChainError {
    /// The block failed consensus validation.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// The block store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A reorganization needed transaction bodies that were already
    /// finalized away.
    #[error("block {0} required for reorganization has been pruned")]
    Pruned(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
