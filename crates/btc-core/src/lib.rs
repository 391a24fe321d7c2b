//! # btc-core
//!
//! Core data model for the Bitcoin P2P node:
//! - Double-SHA256 hashing and 256-bit work arithmetic
//! - Canonical variable-length integer encoding
//! - Block headers, blocks, transactions and Merkle trees
//! - Legacy signature hashing (sighash)
//! - The script verification oracle trait
//! - Immutable per-network parameter bundles

mod block;
mod error;
mod hash;
mod merkle;
mod params;
mod pow;
mod reader;
mod script;
mod sighash;
mod transaction;
mod varint;

pub use block::{Block, BlockHeader, HEADER_SIZE};
pub use error::{ParseError, ParseResult, VerificationError, VerificationResult};
pub use hash::Sha256dHash;
pub use merkle::merkle_root;
pub use params::{Network, NetworkParameters};
pub use pow::{block_work, compact_from_target, target_from_compact};
pub use reader::WireReader;
pub use script::{count_sigops, remove_code_separators, AcceptAllScripts, ScriptError, ScriptVerifier};
pub use sighash::{SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE, SIGHASH_SINGLE};
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput};
pub use varint::{var_int_size, write_var_bytes, write_var_int, write_var_str};

/// One bitcoin, in satoshis.
pub const COIN: i64 = 100_000_000;

/// Largest amount of satoshis that can ever exist.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Maximum number of signature operations allowed in a block.
pub const MAX_BLOCK_SIGOPS: usize = 20_000;

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Protocol version spoken by this library.
pub const PROTOCOL_VERSION: u32 = 70001;
