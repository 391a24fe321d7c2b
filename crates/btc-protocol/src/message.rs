//! P2P protocol messages.
//!
//! One [`Message`] variant per wire command, each with a bit-exact payload
//! encoding. Parsing enforces the canonical varint rule and per-message
//! entry limits; serialization of an unmutated `tx` or `block` returns the
//! bytes it was parsed from (see `btc-core`).

use crate::{ProtocolError, ProtocolResult};
use btc_core::{
    write_var_bytes, write_var_int, write_var_str, Block, BlockHeader, ParseResult, Sha256dHash,
    Transaction, WireReader,
};
use bytes::{BufMut, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Service bit advertising a full node.
pub const NODE_NETWORK: u64 = 1;

/// Maximum entries in an `addr` message.
pub const MAX_ADDR_ENTRIES: usize = 1024;

/// Maximum entries in `inv`, `getdata` and `notfound` messages.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum locator hashes in `getblocks`/`getheaders`.
pub const MAX_LOCATOR_HASHES: usize = 500;

/// Maximum headers in a `headers` message.
const MAX_HEADERS: usize = 2000;

/// Maximum user agent length in a `version` message.
const MAX_USER_AGENT: usize = 256;

/// Maximum bloom filter size in a `filterload` message.
const MAX_FILTER_SIZE: usize = 36_000;

/// Maximum element size in a `filteradd` message.
const MAX_FILTER_ADD: usize = 520;

/// Maximum alert payload/signature size.
const MAX_ALERT_SIZE: usize = 65_536;

/// A network address as carried in `addr` and `version` messages.
///
/// The IP is serialized as 16 bytes, IPv4 mapped into IPv6 space; IP and
/// port are the protocol's only big-endian fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Last-seen time. Absent (zero) inside `version` messages.
    pub time: u32,
    /// Advertised service bits.
    pub services: u64,
    /// IP address.
    pub addr: IpAddr,
    /// TCP port.
    pub port: u16,
}

impl PeerAddress {
    /// Create an address with `NODE_NETWORK` services and no timestamp.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            time: 0,
            services: NODE_NETWORK,
            addr,
            port,
        }
    }

    /// Create from a socket address.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// The socket address this entry points at.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    fn ip_bytes(&self) -> [u8; 16] {
        match self.addr {
            IpAddr::V4(v4) => {
                let mut bytes = [0u8; 16];
                bytes[10] = 0xFF;
                bytes[11] = 0xFF;
                bytes[12..].copy_from_slice(&v4.octets());
                bytes
            }
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Serialize. `with_time` is false inside `version` messages, which
    /// predate the timestamp field.
    pub fn write(&self, buf: &mut Vec<u8>, with_time: bool) {
        if with_time {
            buf.put_u32_le(self.time);
        }
        buf.put_u64_le(self.services);
        buf.put_slice(&self.ip_bytes());
        buf.put_u16(self.port);
    }

    /// Parse, reading the timestamp only when `with_time` is set.
    pub fn parse(r: &mut WireReader<'_>, with_time: bool) -> ParseResult<Self> {
        let time = if with_time { r.read_u32_le()? } else { 0 };
        let services = r.read_u64_le()?;
        let ip = r.read_slice(16)?;
        let port = r.read_u16_be()?;

        let mut octets = [0u8; 16];
        octets.copy_from_slice(ip);
        let addr = if octets[..10] == [0u8; 10] && octets[10] == 0xFF && octets[11] == 0xFF {
            IpAddr::V4(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
        } else {
            IpAddr::V6(Ipv6Addr::from(octets))
        };

        Ok(Self {
            time,
            services,
            addr,
            port,
        })
    }
}

/// The `version` handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version spoken by the sender.
    pub version: u32,
    /// Service bits.
    pub services: u64,
    /// Sender's clock, seconds since the epoch.
    pub timestamp: u64,
    /// Address of the node the message is sent to.
    pub receiver: PeerAddress,
    /// Address of the sender.
    pub sender: PeerAddress,
    /// Random nonce for self-connection detection.
    pub nonce: u64,
    /// Free-form client identifier.
    pub user_agent: String,
    /// Height of the sender's best chain.
    pub start_height: u32,
    /// BIP37: whether unsolicited transactions should be relayed.
    pub relay: bool,
}

impl VersionMessage {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.services);
        buf.put_u64_le(self.timestamp);
        self.receiver.write(buf, false);
        self.sender.write(buf, false);
        buf.put_u64_le(self.nonce);
        write_var_str(buf, &self.user_agent);
        buf.put_u32_le(self.start_height);
        buf.put_u8(self.relay as u8);
    }

    fn parse(r: &mut WireReader<'_>) -> ParseResult<Self> {
        let version = r.read_u32_le()?;
        let services = r.read_u64_le()?;
        let timestamp = r.read_u64_le()?;
        let receiver = PeerAddress::parse(r, false)?;
        let sender = PeerAddress::parse(r, false)?;
        let nonce = r.read_u64_le()?;
        let user_agent = r.read_var_str(MAX_USER_AGENT)?;
        let start_height = r.read_u32_le()?;
        // Absent on pre-BIP37 peers; defaults on.
        let relay = if r.is_empty() { true } else { r.read_u8()? != 0 };
        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Kind of object referenced by an inventory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    /// Error placeholder.
    Error,
    /// A transaction.
    Transaction,
    /// A block.
    Block,
    /// A kind this implementation does not know.
    Other(u32),
}

impl InvKind {
    fn to_u32(self) -> u32 {
        match self {
            InvKind::Error => 0,
            InvKind::Transaction => 1,
            InvKind::Block => 2,
            InvKind::Other(v) => v,
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            0 => InvKind::Error,
            1 => InvKind::Transaction,
            2 => InvKind::Block,
            other => InvKind::Other(other),
        }
    }
}

/// One entry of an `inv`, `getdata` or `notfound` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    /// What the hash refers to.
    pub kind: InvKind,
    /// Hash of the object.
    pub hash: Sha256dHash,
}

impl InventoryItem {
    /// An item announcing a transaction.
    pub fn tx(hash: Sha256dHash) -> Self {
        Self {
            kind: InvKind::Transaction,
            hash,
        }
    }

    /// An item announcing a block.
    pub fn block(hash: Sha256dHash) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.kind.to_u32());
        buf.put_slice(self.hash.as_bytes());
    }

    fn parse(r: &mut WireReader<'_>) -> ParseResult<Self> {
        let kind = InvKind::from_u32(r.read_u32_le()?);
        let hash = r.read_hash()?;
        Ok(Self { kind, hash })
    }
}

/// `getblocks` / `getheaders` request: a block locator plus stop hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    /// Protocol version.
    pub version: u32,
    /// Block locator hashes, newest first with exponential thinning.
    pub locator: Vec<Sha256dHash>,
    /// Hash to stop at, or zero for as-many-as-possible.
    pub stop: Sha256dHash,
}

impl GetBlocksMessage {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.version);
        write_var_int(buf, self.locator.len() as u64);
        for hash in &self.locator {
            buf.put_slice(hash.as_bytes());
        }
        buf.put_slice(self.stop.as_bytes());
    }

    fn parse(r: &mut WireReader<'_>, command: &'static str) -> ProtocolResult<Self> {
        let version = r.read_u32_le()?;
        let count = r.read_var_int()? as usize;
        if count > MAX_LOCATOR_HASHES {
            return Err(ProtocolError::TooManyEntries {
                command,
                count,
                max: MAX_LOCATOR_HASHES,
            });
        }
        let mut locator = Vec::with_capacity(count);
        for _ in 0..count {
            locator.push(r.read_hash()?);
        }
        let stop = r.read_hash()?;
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}

/// `headers` response: block headers without transaction bodies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadersMessage {
    /// Headers in chain order.
    pub headers: Vec<BlockHeader>,
}

/// BIP37 `filterload` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoadMessage {
    /// The bloom filter bit field.
    pub filter: Vec<u8>,
    /// Number of hash functions.
    pub hash_funcs: u32,
    /// Random tweak mixed into each hash.
    pub tweak: u32,
    /// Update-on-match behavior flags.
    pub flags: u8,
}

/// `merkleblock`: a header plus a partial Merkle branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    /// The block header.
    pub header: BlockHeader,
    /// Number of transactions in the full block.
    pub total_transactions: u32,
    /// Hashes of the partial Merkle tree, depth first.
    pub hashes: Vec<Sha256dHash>,
    /// Traversal bit flags.
    pub flags: Vec<u8>,
}

/// Legacy signed `alert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    /// Serialized alert payload.
    pub payload: Vec<u8>,
    /// ECDSA signature over the payload.
    pub signature: Vec<u8>,
}

/// BIP61 reject codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// Message could not be decoded.
    Malformed,
    /// Object was invalid.
    Invalid,
    /// Version no longer supported.
    Obsolete,
    /// Duplicate of an already-received object.
    Duplicate,
    /// Transaction is non-standard.
    Nonstandard,
    /// Output below the dust threshold.
    Dust,
    /// Fee too low.
    InsufficientFee,
    /// Block conflicts with a checkpoint.
    Checkpoint,
    /// A code this implementation does not know.
    Other(u8),
}

impl RejectCode {
    fn to_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(v) => v,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }
}

/// BIP61 `reject` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command the rejection refers to.
    pub message: String,
    /// Rejection code.
    pub code: RejectCode,
    /// Free-form reason.
    pub reason: String,
    /// Optional object hash or extra data.
    pub data: Vec<u8>,
}

/// A P2P message, tagged by wire command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake opener.
    Version(VersionMessage),
    /// Handshake acknowledgement.
    Verack,
    /// Known peer addresses.
    Addr(Vec<PeerAddress>),
    /// Inventory announcement.
    Inv(Vec<InventoryItem>),
    /// Request for announced objects.
    GetData(Vec<InventoryItem>),
    /// Objects we were asked for but do not have.
    NotFound(Vec<InventoryItem>),
    /// Request for block inventory.
    GetBlocks(GetBlocksMessage),
    /// Request for headers.
    GetHeaders(GetBlocksMessage),
    /// A transaction.
    Tx(Transaction),
    /// A full block.
    Block(Block),
    /// Headers response.
    Headers(HeadersMessage),
    /// Request for addresses.
    GetAddr,
    /// BIP35 request for mempool contents.
    Mempool,
    /// Keepalive probe.
    Ping(u64),
    /// Keepalive response.
    Pong(u64),
    /// BIP37 filter installation.
    FilterLoad(FilterLoadMessage),
    /// BIP37 filter extension.
    FilterAdd(Vec<u8>),
    /// BIP37 filter removal.
    FilterClear,
    /// Filtered block.
    MerkleBlock(MerkleBlockMessage),
    /// Legacy network alert.
    Alert(AlertMessage),
    /// BIP61 rejection notice.
    Reject(RejectMessage),
    /// A command this implementation does not know. Skipped with a logged
    /// warning; the connection stays up.
    Unknown {
        /// The unparsed command string.
        command: String,
        /// The raw payload.
        payload: Bytes,
    },
}

impl Message {
    /// The wire command string.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks(_) => "getblocks",
            Message::GetHeaders(_) => "getheaders",
            Message::Tx(_) => "tx",
            Message::Block(_) => "block",
            Message::Headers(_) => "headers",
            Message::GetAddr => "getaddr",
            Message::Mempool => "mempool",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Alert(_) => "alert",
            Message::Reject(_) => "reject",
            Message::Unknown { command, .. } => command,
        }
    }

    /// Encode the payload (everything after the frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => v.write(&mut buf),
            Message::Verack
            | Message::GetAddr
            | Message::Mempool
            | Message::FilterClear => {}
            Message::Addr(addresses) => {
                write_var_int(&mut buf, addresses.len() as u64);
                for address in addresses {
                    address.write(&mut buf, true);
                }
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write_var_int(&mut buf, items.len() as u64);
                for item in items {
                    item.write(&mut buf);
                }
            }
            Message::GetBlocks(m) | Message::GetHeaders(m) => m.write(&mut buf),
            Message::Tx(tx) => buf.extend_from_slice(&tx.serialize()),
            Message::Block(block) => buf.extend_from_slice(&block.serialize()),
            Message::Headers(m) => {
                write_var_int(&mut buf, m.headers.len() as u64);
                for header in &m.headers {
                    header.write(&mut buf);
                    // Headers travel with an always-zero tx count.
                    write_var_int(&mut buf, 0);
                }
            }
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::FilterLoad(m) => {
                write_var_bytes(&mut buf, &m.filter);
                buf.put_u32_le(m.hash_funcs);
                buf.put_u32_le(m.tweak);
                buf.put_u8(m.flags);
            }
            Message::FilterAdd(data) => write_var_bytes(&mut buf, data),
            Message::MerkleBlock(m) => {
                m.header.write(&mut buf);
                buf.put_u32_le(m.total_transactions);
                write_var_int(&mut buf, m.hashes.len() as u64);
                for hash in &m.hashes {
                    buf.put_slice(hash.as_bytes());
                }
                write_var_bytes(&mut buf, &m.flags);
            }
            Message::Alert(m) => {
                write_var_bytes(&mut buf, &m.payload);
                write_var_bytes(&mut buf, &m.signature);
            }
            Message::Reject(m) => {
                write_var_str(&mut buf, &m.message);
                buf.put_u8(m.code.to_u8());
                write_var_str(&mut buf, &m.reason);
                buf.extend_from_slice(&m.data);
            }
            Message::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        buf
    }

    /// Parse a payload for the given command.
    pub fn parse_payload(command: &str, payload: &Bytes) -> ProtocolResult<Message> {
        let mut r = WireReader::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::parse(&mut r)?),
            "verack" => Message::Verack,
            "addr" => {
                let count = r.read_var_int()? as usize;
                if count > MAX_ADDR_ENTRIES {
                    return Err(ProtocolError::TooManyEntries {
                        command: "addr",
                        count,
                        max: MAX_ADDR_ENTRIES,
                    });
                }
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(PeerAddress::parse(&mut r, true)?);
                }
                Message::Addr(addresses)
            }
            "inv" => Message::Inv(parse_inventory(&mut r, "inv")?),
            "getdata" => Message::GetData(parse_inventory(&mut r, "getdata")?),
            "notfound" => Message::NotFound(parse_inventory(&mut r, "notfound")?),
            "getblocks" => Message::GetBlocks(GetBlocksMessage::parse(&mut r, "getblocks")?),
            "getheaders" => Message::GetHeaders(GetBlocksMessage::parse(&mut r, "getheaders")?),
            "tx" => {
                let tx = Transaction::parse(&mut r, payload)?;
                Message::Tx(tx)
            }
            "block" => {
                let block = Block::parse(&mut r, payload)?;
                Message::Block(block)
            }
            "headers" => {
                let count = r.read_var_int()? as usize;
                if count > MAX_HEADERS {
                    return Err(ProtocolError::TooManyEntries {
                        command: "headers",
                        count,
                        max: MAX_HEADERS,
                    });
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::parse(&mut r)?);
                    // Discard the always-zero tx count.
                    r.read_var_int()?;
                }
                Message::Headers(HeadersMessage { headers })
            }
            "getaddr" => Message::GetAddr,
            "mempool" => Message::Mempool,
            "ping" => Message::Ping(r.read_u64_le()?),
            "pong" => Message::Pong(r.read_u64_le()?),
            "filterload" => {
                let filter = r.read_var_bytes(MAX_FILTER_SIZE)?;
                let hash_funcs = r.read_u32_le()?;
                let tweak = r.read_u32_le()?;
                let flags = r.read_u8()?;
                Message::FilterLoad(FilterLoadMessage {
                    filter,
                    hash_funcs,
                    tweak,
                    flags,
                })
            }
            "filteradd" => Message::FilterAdd(r.read_var_bytes(MAX_FILTER_ADD)?),
            "filterclear" => Message::FilterClear,
            "merkleblock" => {
                let header = BlockHeader::parse(&mut r)?;
                let total_transactions = r.read_u32_le()?;
                let count = r.read_var_int()? as usize;
                if count > MAX_INV_ENTRIES {
                    return Err(ProtocolError::TooManyEntries {
                        command: "merkleblock",
                        count,
                        max: MAX_INV_ENTRIES,
                    });
                }
                let mut hashes = Vec::with_capacity(count);
                for _ in 0..count {
                    hashes.push(r.read_hash()?);
                }
                let flags = r.read_var_bytes(MAX_FILTER_SIZE)?;
                Message::MerkleBlock(MerkleBlockMessage {
                    header,
                    total_transactions,
                    hashes,
                    flags,
                })
            }
            "alert" => {
                let alert_payload = r.read_var_bytes(MAX_ALERT_SIZE)?;
                let signature = r.read_var_bytes(MAX_ALERT_SIZE)?;
                Message::Alert(AlertMessage {
                    payload: alert_payload,
                    signature,
                })
            }
            "reject" => {
                let message = r.read_var_str(MAX_USER_AGENT)?;
                let code = RejectCode::from_u8(r.read_u8()?);
                let reason = r.read_var_str(MAX_USER_AGENT)?;
                let data = r.read_bytes(r.remaining())?;
                Message::Reject(RejectMessage {
                    message,
                    code,
                    reason,
                    data,
                })
            }
            other => Message::Unknown {
                command: other.to_string(),
                payload: payload.clone(),
            },
        };
        Ok(message)
    }
}

fn parse_inventory(
    r: &mut WireReader<'_>,
    command: &'static str,
) -> ProtocolResult<Vec<InventoryItem>> {
    let count = r.read_var_int()? as usize;
    if count > MAX_INV_ENTRIES {
        return Err(ProtocolError::TooManyEntries {
            command,
            count,
            max: MAX_INV_ENTRIES,
        });
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InventoryItem::parse(r)?);
    }
    Ok(items)
}
