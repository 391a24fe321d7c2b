//! Bootstrap peer discovery.
//!
//! Addresses come from two pluggable sources: DNS seeds resolved off the
//! async runtime, and a fixed bootstrap list used as fallback.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// DNS seeds operated for the production network.
pub const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
];

/// DNS seeds for the test network.
pub const TESTNET_DNS_SEEDS: &[&str] = &["testnet-seed.bitcoin.jonasschnelli.ch"];

/// Bootstrap source combining DNS seeds with a static peer list.
pub struct PeerDiscovery {
    seeds: Vec<String>,
    bootstrap: Vec<SocketAddr>,
    default_port: u16,
    dns_timeout: Duration,
}

impl PeerDiscovery {
    /// Create a discovery source over the given DNS seeds.
    pub fn new(seeds: &[&str], default_port: u16) -> Self {
        Self {
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            bootstrap: Vec::new(),
            default_port,
            dns_timeout: Duration::from_secs(10),
        }
    }

    /// Discovery with no DNS seeds, only fixed peers.
    pub fn bootstrap_only(peers: Vec<SocketAddr>, default_port: u16) -> Self {
        Self {
            seeds: Vec::new(),
            bootstrap: peers,
            default_port,
            dns_timeout: Duration::from_secs(10),
        }
    }

    /// Add fixed bootstrap peers consulted when DNS yields nothing.
    pub fn with_bootstrap(mut self, peers: Vec<SocketAddr>) -> Self {
        self.bootstrap.extend(peers);
        self
    }

    /// Set the DNS resolution timeout.
    pub fn with_timeout(mut self, dns_timeout: Duration) -> Self {
        self.dns_timeout = dns_timeout;
        self
    }

    /// Resolve every seed, falling back to the bootstrap list when DNS
    /// produces nothing.
    pub async fn discover(&self) -> Vec<SocketAddr> {
        let mut peers = Vec::new();

        for seed in &self.seeds {
            match self.resolve_seed(seed).await {
                Ok(addrs) => {
                    info!(seed = %seed, count = addrs.len(), "Resolved DNS seed");
                    peers.extend(addrs);
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Failed to resolve DNS seed");
                }
            }
        }

        if peers.is_empty() {
            debug!("No peers from DNS, using bootstrap list");
            peers.extend(self.bootstrap.iter().copied());
        }

        peers.sort();
        peers.dedup();
        info!(count = peers.len(), "Discovered peer candidates");
        peers
    }

    async fn resolve_seed(&self, seed: &str) -> Result<Vec<SocketAddr>, std::io::Error> {
        let host = if seed.contains(':') {
            seed.to_string()
        } else {
            format!("{}:{}", seed, self.default_port)
        };

        let result = timeout(
            self.dns_timeout,
            tokio::task::spawn_blocking(move || {
                host.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            }),
        )
        .await;

        match result {
            Ok(Ok(Ok(addrs))) => Ok(addrs),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(std::io::Error::other(format!("task join error: {e}"))),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "DNS resolution timed out",
            )),
        }
    }
}
