//! Peer group configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the peer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerGroupConfig {
    /// Client name advertised in the version handshake.
    pub user_agent: String,
    /// Client version advertised in the version handshake.
    pub user_agent_version: String,
    /// Target number of outbound connections. Mutable at runtime through
    /// [`crate::PeerGroup::set_max_connections`].
    pub max_connections: usize,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Deadline for the version/verack exchange.
    pub handshake_timeout: Duration,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Deadline for a matching pong before the peer is disconnected.
    pub ping_timeout: Duration,
    /// Deadline for a requested block to arrive.
    pub block_request_timeout: Duration,
    /// Peers that must request a broadcast transaction before the
    /// broadcast is considered complete.
    pub min_broadcast_connections: usize,
    /// Deadline for a broadcast to complete.
    pub broadcast_timeout: Duration,
    /// Whether to fetch the dependencies of relayed transactions.
    pub download_tx_dependencies: bool,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            user_agent: "btc-rust-node".to_string(),
            user_agent_version: env!("CARGO_PKG_VERSION").to_string(),
            max_connections: 8,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(120),
            ping_timeout: Duration::from_secs(20),
            block_request_timeout: Duration::from_secs(60),
            min_broadcast_connections: 2,
            broadcast_timeout: Duration::from_secs(60),
            download_tx_dependencies: false,
        }
    }
}

impl PeerGroupConfig {
    /// The user agent string placed on the wire, in the conventional
    /// `/name:version/` form.
    pub fn wire_user_agent(&self) -> String {
        format!("/{}:{}/", self.user_agent, self.user_agent_version)
    }
}
