//! Error types for parsing and consensus validation.

use thiserror::Error;

/// Errors raised while decoding wire bytes into model types.
///
/// Every variant carries the byte offset at which decoding failed so that
/// protocol errors can be reported against the original buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Ran off the end of the buffer.
    #[error("unexpected end of data at offset {offset}: wanted {wanted} bytes, {available} available")]
    UnexpectedEof {
        offset: usize,
        wanted: usize,
        available: usize,
    },

    /// A variable-length integer was not encoded in its shortest form.
    #[error("non-canonical varint at offset {offset}")]
    NonCanonicalVarInt { offset: usize },

    /// A length prefix exceeded the allowed maximum.
    #[error("oversized element at offset {offset}: {size} > {max}")]
    Oversized {
        offset: usize,
        size: usize,
        max: usize,
    },

    /// Structurally invalid data.
    #[error("malformed data at offset {offset}: {what}")]
    Malformed { offset: usize, what: String },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },
}

/// Result type for parse operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Consensus validation failures.
///
/// A block that produces any of these is rejected; the chain state is
/// guaranteed untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// Header hash does not meet the target decoded from `bits`.
    #[error("proof of work invalid: hash {hash} above target")]
    BadPow { hash: String },

    /// Header `bits` decode to a target outside the allowed range.
    #[error("difficulty invalid: got {got:#010x}, expected {expected:#010x}")]
    BadDifficulty { got: u32, expected: u32 },

    /// Merkle root in the header does not match the transaction tree.
    #[error("merkle root mismatch: header {header}, computed {computed}")]
    BadMerkleRoot { header: String, computed: String },

    /// Block timestamp is too old or too far in the future.
    #[error("timestamp invalid: block time {block_time}, limit {limit}")]
    BadTimestamp { block_time: u32, limit: u32 },

    /// Block hash does not match a mandatory checkpoint.
    #[error("checkpoint mismatch at height {height}: got {got}")]
    CheckpointMismatch { height: u32, got: String },

    /// An input spends an output that is missing from the UTXO set.
    #[error("double spend or missing output: {hash}:{index}")]
    DoubleSpend { hash: String, index: u32 },

    /// Script verification failed for an input.
    #[error("invalid script on input {input_index} of {tx}: {reason}")]
    InvalidScript {
        tx: String,
        input_index: usize,
        reason: String,
    },

    /// A coinbase output was spent before reaching maturity.
    #[error("immature coinbase spend: created at height {created}, spent at height {spent}")]
    CoinbaseImmature { created: u32, spent: u32 },

    /// Output values are negative or sum beyond the 21M coin cap.
    #[error("value out of range: {value}")]
    ValueOverflow { value: i64 },

    /// Block exceeds the signature-operation ceiling.
    #[error("too many sigops: {count} > {max}")]
    TooManySigOps { count: usize, max: usize },

    /// Two transactions in the block hash identically, or an earlier
    /// transaction with the same hash still has unspent outputs.
    #[error("duplicate transaction: {hash}")]
    DuplicateTransaction { hash: String },

    /// Structurally invalid block.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// Structurally invalid transaction.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// Result type for consensus validation.
pub type VerificationResult<T> = Result<T, VerificationError>;
