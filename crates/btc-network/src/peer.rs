//! Per-connection peer state machine.

use crate::{NetworkError, NetworkResult, PeerGroupConfig};
use btc_core::Sha256dHash;
use btc_protocol::{FrameCodec, InventoryItem, Message, VersionMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// Peers are identified by their socket address.
pub type PeerId = SocketAddr;

/// How many recently-seen inventory hashes each peer remembers.
const INVENTORY_WINDOW: usize = 10_000;

/// How often deadlines (pings, block requests) are checked.
const DEADLINE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLifecycle {
    /// Created, not yet connected.
    New,
    /// Version/verack exchange in progress.
    Handshaking,
    /// Handshake complete; messages flowing.
    Connected,
    /// Connection over.
    Disconnected,
}

/// Events a peer task reports to the group supervisor.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed.
    Connected { peer: PeerId },
    /// Connection ended.
    Disconnected { peer: PeerId },
    /// A message arrived that the peer did not consume itself.
    Message { peer: PeerId, message: Message },
    /// An outbound dial or handshake failed.
    ConnectFailed { addr: SocketAddr, error: String },
}

/// Bounded recently-seen inventory window.
struct InventoryWindow {
    seen: HashSet<Sha256dHash>,
    order: VecDeque<Sha256dHash>,
}

impl InventoryWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember a hash; returns false when it was already known.
    fn insert(&mut self, hash: Sha256dHash) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        while self.order.len() > INVENTORY_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Shared handle to one remote peer.
///
/// The I/O runs in a spawned task ([`run_connection`]); this handle carries
/// the state the group reads (height, ping stats, lifecycle) and the outbox
/// used to send messages.
pub struct Peer {
    addr: SocketAddr,
    outbound: bool,
    lifecycle: RwLock<PeerLifecycle>,
    version: RwLock<Option<VersionMessage>>,
    best_height: AtomicU32,
    /// Nonce of every ping in flight, with its send time.
    ping_nonces: Mutex<HashMap<u64, Instant>>,
    /// Exponentially-weighted average round trip, microseconds.
    ping_time_us: AtomicU64,
    /// Most recent round trip sample, microseconds.
    last_ping_time_us: AtomicU64,
    known_inventory: Mutex<InventoryWindow>,
    /// Blocks requested from this peer that have not arrived yet.
    pending_blocks: Mutex<HashMap<Sha256dHash, Instant>>,
    outbox: mpsc::Sender<Message>,
}

impl Peer {
    /// Create a peer handle and the outbox receiver its task will drain.
    pub fn new(addr: SocketAddr, outbound: bool) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbox, outbox_rx) = mpsc::channel(100);
        let peer = Arc::new(Self {
            addr,
            outbound,
            lifecycle: RwLock::new(PeerLifecycle::New),
            version: RwLock::new(None),
            best_height: AtomicU32::new(0),
            ping_nonces: Mutex::new(HashMap::new()),
            ping_time_us: AtomicU64::new(0),
            last_ping_time_us: AtomicU64::new(0),
            known_inventory: Mutex::new(InventoryWindow::new()),
            pending_blocks: Mutex::new(HashMap::new()),
            outbox,
        });
        (peer, outbox_rx)
    }

    /// Remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Peer identity.
    pub fn id(&self) -> PeerId {
        self.addr
    }

    /// True for connections we initiated.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> PeerLifecycle {
        *self.lifecycle.read()
    }

    pub(crate) fn set_lifecycle(&self, state: PeerLifecycle) {
        *self.lifecycle.write() = state;
    }

    /// The remote's version message, once the handshake finished.
    pub fn version(&self) -> Option<VersionMessage> {
        self.version.read().clone()
    }

    pub(crate) fn set_version(&self, version: VersionMessage) {
        self.best_height
            .store(version.start_height, Ordering::Relaxed);
        *self.version.write() = Some(version);
    }

    /// Best chain height the peer has announced.
    pub fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::Relaxed)
    }

    /// Raise the announced height (block announcements move it forward).
    pub fn announce_height(&self, height: u32) {
        self.best_height.fetch_max(height, Ordering::Relaxed);
    }

    /// Exponentially-weighted average ping time.
    pub fn ping_time(&self) -> Duration {
        Duration::from_micros(self.ping_time_us.load(Ordering::Relaxed))
    }

    /// Most recent ping sample.
    pub fn last_ping_time(&self) -> Duration {
        Duration::from_micros(self.last_ping_time_us.load(Ordering::Relaxed))
    }

    /// Queue a message for the peer's writer.
    pub async fn send(&self, message: Message) -> NetworkResult<()> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Send `getdata` for the given blocks and arm their deadlines.
    pub async fn request_blocks(&self, hashes: Vec<Sha256dHash>) -> NetworkResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        {
            let now = Instant::now();
            let mut pending = self.pending_blocks.lock();
            for hash in &hashes {
                pending.insert(*hash, now);
            }
        }
        let items = hashes.into_iter().map(InventoryItem::block).collect();
        self.send(Message::GetData(items)).await
    }

    /// Number of block requests in flight.
    pub fn pending_block_count(&self) -> usize {
        self.pending_blocks.lock().len()
    }

    fn note_ping_sent(&self, nonce: u64) {
        self.ping_nonces.lock().insert(nonce, Instant::now());
    }

    fn record_pong(&self, nonce: u64) {
        let sent = self.ping_nonces.lock().remove(&nonce);
        let Some(sent) = sent else {
            trace!(peer = %self.addr, nonce, "Pong with unknown nonce");
            return;
        };
        let sample = sent.elapsed().as_micros() as u64;
        self.last_ping_time_us.store(sample, Ordering::Relaxed);
        let previous = self.ping_time_us.load(Ordering::Relaxed);
        let averaged = if previous == 0 {
            sample
        } else {
            // EWMA with a 7/8 decay factor.
            (previous * 7 + sample) / 8
        };
        self.ping_time_us.store(averaged, Ordering::Relaxed);
    }

    fn has_overdue_ping(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        self.ping_nonces
            .lock()
            .values()
            .any(|sent| now.duration_since(*sent) > timeout)
    }

    fn has_overdue_block(&self, timeout: Duration) -> bool {
        let now = Instant::now();
        self.pending_blocks
            .lock()
            .values()
            .any(|requested| now.duration_since(*requested) > timeout)
    }

    fn mark_block_received(&self, hash: &Sha256dHash) {
        self.pending_blocks.lock().remove(hash);
    }

    /// Drop already-known items, remember the rest.
    fn filter_new_inventory(&self, items: &[InventoryItem]) -> Vec<InventoryItem> {
        let mut window = self.known_inventory.lock();
        items
            .iter()
            .filter(|item| window.insert(item.hash))
            .copied()
            .collect()
    }

    /// Remember a hash so a future `inv` for it is not re-requested.
    pub fn mark_inventory_known(&self, hash: Sha256dHash) {
        self.known_inventory.lock().insert(hash);
    }
}

/// Drive one peer connection to completion.
///
/// Performs the handshake, then pumps messages until the peer disconnects,
/// a deadline lapses, or the group drops the outbox. Emits `Connected`,
/// `Message` and `Disconnected` events in that order relative to each
/// other.
pub(crate) async fn run_connection(
    stream: TcpStream,
    peer: Arc<Peer>,
    magic: u32,
    our_version: VersionMessage,
    config: PeerGroupConfig,
    mut outbox_rx: mpsc::Receiver<Message>,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut framed = Framed::new(stream, FrameCodec::new(magic));
    peer.set_lifecycle(PeerLifecycle::Handshaking);

    let exchange = tokio::time::timeout(
        config.handshake_timeout,
        handshake(&mut framed, our_version),
    )
    .await;

    let remote_version = match exchange {
        Ok(Ok(version)) => version,
        Ok(Err(e)) => {
            warn!(peer = %peer.addr, error = %e, "Handshake failed");
            peer.set_lifecycle(PeerLifecycle::Disconnected);
            let _ = events
                .send(PeerEvent::ConnectFailed {
                    addr: peer.addr,
                    error: e.to_string(),
                })
                .await;
            return;
        }
        Err(_) => {
            warn!(peer = %peer.addr, "Handshake timed out");
            peer.set_lifecycle(PeerLifecycle::Disconnected);
            let _ = events
                .send(PeerEvent::ConnectFailed {
                    addr: peer.addr,
                    error: NetworkError::HandshakeTimeout.to_string(),
                })
                .await;
            return;
        }
    };

    debug!(
        peer = %peer.addr,
        agent = %remote_version.user_agent,
        height = remote_version.start_height,
        "Handshake complete"
    );
    peer.set_version(remote_version);
    peer.set_lifecycle(PeerLifecycle::Connected);
    let _ = events.send(PeerEvent::Connected { peer: peer.id() }).await;

    let (mut sink, mut stream) = framed.split();
    let mut ping_timer = tokio::time::interval(config.ping_interval);
    let mut deadline_timer = tokio::time::interval(DEADLINE_CHECK_INTERVAL);

    let exit: NetworkResult<()> = 'pump: loop {
        tokio::select! {
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => break 'pump Err(e.into()),
                    None => break 'pump Err(NetworkError::ConnectionClosed),
                };
                match message {
                    Message::Ping(nonce) => {
                        if let Err(e) = sink.send(Message::Pong(nonce)).await {
                            break 'pump Err(e.into());
                        }
                    }
                    Message::Pong(nonce) => peer.record_pong(nonce),
                    Message::Inv(items) => {
                        let fresh = peer.filter_new_inventory(&items);
                        if fresh.is_empty() {
                            continue;
                        }
                        if let Err(e) = sink.send(Message::GetData(fresh.clone())).await {
                            break 'pump Err(e.into());
                        }
                        let _ = events.send(PeerEvent::Message {
                            peer: peer.id(),
                            message: Message::Inv(fresh),
                        }).await;
                    }
                    Message::Block(block) => {
                        peer.mark_block_received(&block.hash());
                        let _ = events.send(PeerEvent::Message {
                            peer: peer.id(),
                            message: Message::Block(block),
                        }).await;
                    }
                    Message::Unknown { .. } => {
                        // Already logged by the codec; connection stays up.
                    }
                    Message::Version(_) | Message::Verack => {
                        debug!(peer = %peer.addr, "Stray handshake message ignored");
                    }
                    other => {
                        let _ = events.send(PeerEvent::Message {
                            peer: peer.id(),
                            message: other,
                        }).await;
                    }
                }
            }

            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            break 'pump Err(e.into());
                        }
                    }
                    // The group dropped us; orderly shutdown.
                    None => break 'pump Ok(()),
                }
            }

            _ = ping_timer.tick() => {
                let nonce: u64 = rand::random();
                peer.note_ping_sent(nonce);
                if let Err(e) = sink.send(Message::Ping(nonce)).await {
                    break 'pump Err(e.into());
                }
            }

            _ = deadline_timer.tick() => {
                if peer.has_overdue_ping(config.ping_timeout) {
                    break 'pump Err(NetworkError::PingTimeout);
                }
                if peer.has_overdue_block(config.block_request_timeout) {
                    break 'pump Err(NetworkError::RequestTimeout);
                }
            }
        }
    };

    if let Err(e) = exit {
        warn!(peer = %peer.addr, error = %e, "Peer connection ended");
    }
    peer.set_lifecycle(PeerLifecycle::Disconnected);
    let _ = events
        .send(PeerEvent::Disconnected { peer: peer.id() })
        .await;
}

/// Version/verack exchange: we open with our version, the remote answers
/// with its version and verack, and our verack completes the handshake.
async fn handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    our_version: VersionMessage,
) -> NetworkResult<VersionMessage> {
    framed.send(Message::Version(our_version)).await?;

    let mut remote_version: Option<VersionMessage> = None;
    let mut got_verack = false;

    while remote_version.is_none() || !got_verack {
        let message = match framed.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(NetworkError::ConnectionClosed),
        };
        match message {
            Message::Version(version) => {
                if remote_version.is_some() {
                    return Err(NetworkError::HandshakeFailed(
                        "duplicate version message".to_string(),
                    ));
                }
                remote_version = Some(version);
            }
            Message::Verack => got_verack = true,
            Message::Unknown { .. } => {}
            other => {
                return Err(NetworkError::HandshakeFailed(format!(
                    "unexpected '{}' before handshake completion",
                    other.command()
                )));
            }
        }
    }

    framed.send(Message::Verack).await?;
    Ok(remote_version.expect("loop exits only with version set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> (Arc<Peer>, mpsc::Receiver<Message>) {
        Peer::new("127.0.0.1:8333".parse().unwrap(), true)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (peer, _rx) = test_peer();
        assert_eq!(peer.lifecycle(), PeerLifecycle::New);
        peer.set_lifecycle(PeerLifecycle::Handshaking);
        peer.set_lifecycle(PeerLifecycle::Connected);
        assert_eq!(peer.lifecycle(), PeerLifecycle::Connected);
    }

    #[test]
    fn test_inventory_filtering() {
        let (peer, _rx) = test_peer();
        let a = InventoryItem::tx(Sha256dHash::hash(b"a"));
        let b = InventoryItem::tx(Sha256dHash::hash(b"b"));

        let fresh = peer.filter_new_inventory(&[a, b]);
        assert_eq!(fresh.len(), 2);

        // Second announcement of the same items is fully filtered.
        let fresh = peer.filter_new_inventory(&[a, b]);
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_ping_stats() {
        let (peer, _rx) = test_peer();
        peer.note_ping_sent(1);
        peer.record_pong(1);
        // A pong for an unknown nonce is ignored.
        peer.record_pong(99);
        assert_eq!(peer.ping_time(), peer.last_ping_time());
    }

    #[test]
    fn test_height_announcements_only_increase() {
        let (peer, _rx) = test_peer();
        peer.announce_height(100);
        peer.announce_height(50);
        assert_eq!(peer.best_height(), 100);
        peer.announce_height(150);
        assert_eq!(peer.best_height(), 150);
    }

    #[tokio::test]
    async fn test_request_blocks_arms_deadlines() {
        let (peer, mut rx) = test_peer();
        let hash = Sha256dHash::hash(b"block");
        peer.request_blocks(vec![hash]).await.unwrap();
        assert_eq!(peer.pending_block_count(), 1);
        assert!(matches!(rx.recv().await, Some(Message::GetData(_))));

        peer.mark_block_received(&hash);
        assert_eq!(peer.pending_block_count(), 0);
    }

    #[test]
    fn test_inventory_window_bounded() {
        let mut window = InventoryWindow::new();
        for i in 0..(INVENTORY_WINDOW + 100) {
            window.insert(Sha256dHash::hash(&(i as u64).to_le_bytes()));
        }
        assert_eq!(window.seen.len(), INVENTORY_WINDOW);
        assert_eq!(window.order.len(), INVENTORY_WINDOW);
    }
}
