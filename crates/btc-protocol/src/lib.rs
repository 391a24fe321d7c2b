//! # btc-protocol
//!
//! The Bitcoin P2P wire protocol as of version 70001:
//! - Every protocol message as a tagged [`Message`] variant
//! - Bit-exact payload encoding and canonical-enforcing parsing
//! - The frame codec (magic, command, length, double-SHA256 checksum)
//!   implementing `tokio_util`'s `Decoder`/`Encoder`
//! - BIP37 bloom filters and partial Merkle trees for filtered blocks

mod bloom;
mod codec;
mod error;
mod merkle_block;
mod message;

pub use bloom::BloomFilter;
pub use codec::{FrameCodec, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    AlertMessage, FilterLoadMessage, GetBlocksMessage, HeadersMessage, InvKind, InventoryItem,
    MerkleBlockMessage, Message, PeerAddress, RejectCode, RejectMessage, VersionMessage,
    MAX_ADDR_ENTRIES, MAX_INV_ENTRIES, MAX_LOCATOR_HASHES, NODE_NETWORK,
};
