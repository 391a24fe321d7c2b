//! Networking errors.

use btc_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by peers and the peer group.
///
/// Peer-level failures are recovered locally: the peer is disconnected and
/// the group reconnects elsewhere.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bytes on the wire.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The version/verack exchange did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote violated the handshake sequence.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// No pong arrived within the ping deadline.
    #[error("ping timed out")]
    PingTimeout,

    /// A requested block did not arrive within the deadline.
    #[error("block request timed out")]
    RequestTimeout,

    /// The remote closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Too few peers requested a broadcast transaction in time.
    #[error("broadcast incomplete: {got} of {needed} peers requested the transaction")]
    BroadcastTimeout { got: usize, needed: usize },

    /// The peer group is not running.
    #[error("peer group is not running")]
    NotRunning,
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
