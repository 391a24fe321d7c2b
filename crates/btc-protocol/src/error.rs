//! Wire protocol errors.

use btc_core::ParseError;
use thiserror::Error;

/// Errors raised by the framing codec and message parsers.
///
/// A protocol error disconnects the offending peer; it is never fatal to
/// the node.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame magic did not match the configured network.
    #[error("bad packet magic: expected {expected:#010x}, got {got:#010x}")]
    BadMagic { expected: u32, got: u32 },

    /// Frame command field was not NUL-padded ASCII.
    #[error("unparseable command field: {0}")]
    BadCommand(String),

    /// Frame checksum did not match the payload.
    #[error("checksum mismatch on '{command}' message")]
    BadChecksum { command: String },

    /// Frame or element larger than allowed.
    #[error("oversized message: {size} bytes, max {max}")]
    Oversized { size: usize, max: usize },

    /// A list-bearing message exceeded its entry limit.
    #[error("too many entries in '{command}': {count} > {max}")]
    TooManyEntries {
        command: &'static str,
        count: usize,
        max: usize,
    },

    /// Payload bytes failed to parse; carries the offset and cause.
    #[error("malformed '{command}' payload: {source}")]
    BadPayload {
        command: String,
        #[source]
        source: ParseError,
    },

    /// Bare parse failure; wrapped with its command by the codec.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
