//! Connection candidate pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Base backoff applied after the first failed connection attempt.
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling on per-address backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default)]
struct Candidate {
    /// When we last completed a successful connection.
    last_success: Option<Instant>,
    /// When we last tried to connect.
    last_attempt: Option<Instant>,
    /// Consecutive failures since the last success.
    failures: u32,
}

impl Candidate {
    fn backoff(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let exp = self.failures.min(16);
        let backoff = BASE_BACKOFF * 2u32.saturating_pow(exp - 1);
        backoff.min(MAX_BACKOFF)
    }

    fn ready_at(&self) -> Option<Instant> {
        self.last_attempt.map(|t| t + self.backoff())
    }
}

/// Pool of addresses the group may dial.
///
/// Selection prefers addresses never tried, then previously-successful
/// ones, then failed ones whose exponential backoff has elapsed.
#[derive(Default)]
pub struct AddressPool {
    candidates: HashMap<SocketAddr, Candidate>,
}

impl AddressPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// True when no addresses are known.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Add an address if not already known.
    pub fn add(&mut self, addr: SocketAddr) {
        self.candidates.entry(addr).or_default();
    }

    /// Add many addresses.
    pub fn add_all(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            self.add(addr);
        }
    }

    /// Record a connection attempt starting now.
    pub fn note_attempt(&mut self, addr: SocketAddr) {
        self.candidates.entry(addr).or_default().last_attempt = Some(Instant::now());
    }

    /// Record a completed handshake; resets the failure counter.
    pub fn note_success(&mut self, addr: SocketAddr) {
        let candidate = self.candidates.entry(addr).or_default();
        candidate.last_success = Some(Instant::now());
        candidate.failures = 0;
    }

    /// Record a failed or dropped connection.
    pub fn note_failure(&mut self, addr: SocketAddr) {
        let candidate = self.candidates.entry(addr).or_default();
        candidate.failures = candidate.failures.saturating_add(1);
        debug!(addr = %addr, failures = candidate.failures, "Connection candidate failed");
    }

    /// Pick the next address to dial, skipping any in `exclude`.
    ///
    /// Unseen candidates come first, then previously-successful ones, then
    /// failed ones once their backoff expires.
    pub fn next_candidate(&mut self, exclude: &dyn Fn(&SocketAddr) -> bool) -> Option<SocketAddr> {
        let now = Instant::now();

        let mut best: Option<(u8, Instant, SocketAddr)> = None;
        for (addr, candidate) in &self.candidates {
            if exclude(addr) {
                continue;
            }
            if let Some(ready_at) = candidate.ready_at() {
                if ready_at > now {
                    continue;
                }
            }
            // Rank: unseen < successful < failed; earlier attempts first.
            let rank = match (candidate.last_attempt, candidate.failures) {
                (None, _) => 0u8,
                (_, 0) => 1,
                _ => 2,
            };
            let attempt = candidate.last_attempt.unwrap_or(now - Duration::from_secs(1));
            let key = (rank, attempt, *addr);
            if best.map_or(true, |b| (key.0, key.1) < (b.0, b.1)) {
                best = Some(key);
            }
        }

        let addr = best.map(|(_, _, addr)| addr)?;
        self.note_attempt(addr);
        Some(addr)
    }
}
