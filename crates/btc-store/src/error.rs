//! Storage errors.

use thiserror::Error;

/// Errors from the block store.
///
/// Store failures are fatal to block acceptance unless the caller
/// explicitly retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A block's parent is not present; ancestor closure would break.
    #[error("parent {parent} of {block} not in store")]
    OrphanParent { block: String, parent: String },

    /// Batch operation without an active batch.
    #[error("no batch in progress")]
    NoActiveBatch,

    /// A batch is already open.
    #[error("batch already in progress")]
    BatchInProgress,

    /// Chain head accessed before initialization.
    #[error("chain head not initialized")]
    NoChainHead,

    /// Backend I/O failure.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
