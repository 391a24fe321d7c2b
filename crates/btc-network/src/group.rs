//! Peer group: discovery, connection supervision, download-peer election
//! and transaction broadcast.

use crate::peer::{run_connection, Peer, PeerEvent, PeerId, PeerLifecycle};
use crate::{AddressPool, NetworkError, NetworkResult, PeerDiscovery, PeerGroupConfig};
use btc_chain::{ChainError, FullPrunedBlockChain};
use btc_core::{NetworkParameters, Sha256dHash, Transaction, PROTOCOL_VERSION};
use btc_protocol::{InvKind, InventoryItem, Message, PeerAddress, VersionMessage, NODE_NETWORK};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the supervisor tops up outbound connections.
const CONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// How many addresses a `getaddr` response samples.
const GETADDR_SAMPLE: usize = 30;

/// Observer of peer group events.
///
/// Callbacks run on the supervisor task and must not block. Events for one
/// peer arrive in order; `on_peer_connected` always precedes any other
/// event from that peer.
pub trait PeerGroupListener: Send + Sync {
    /// A peer finished its handshake.
    fn on_peer_connected(&self, _peer: &Arc<Peer>, _peer_count: usize) {}

    /// A peer disconnected.
    fn on_peer_disconnected(&self, _peer: &Arc<Peer>, _peer_count: usize) {}

    /// A peer relayed a transaction.
    fn on_transaction(&self, _peer: &Arc<Peer>, _tx: &Transaction) {}

    /// A non-download peer announced a block.
    fn on_block_announced(&self, _peer: &Arc<Peer>, _hash: &Sha256dHash) {}
}

struct BroadcastEntry {
    tx: Transaction,
    requested: HashSet<PeerId>,
    needed: usize,
    done: Option<oneshot::Sender<usize>>,
}

/// Maintains a target number of outbound peers, elects the download peer,
/// relays broadcasts and feeds received blocks into the chain.
pub struct PeerGroup {
    params: Arc<NetworkParameters>,
    chain: Arc<FullPrunedBlockChain>,
    config: RwLock<PeerGroupConfig>,
    discovery: PeerDiscovery,
    peers: Arc<DashMap<PeerId, Arc<Peer>>>,
    pool: Mutex<AddressPool>,
    download_peer: RwLock<Option<PeerId>>,
    listeners: RwLock<Vec<Arc<dyn PeerGroupListener>>>,
    broadcasts: Mutex<HashMap<Sha256dHash, BroadcastEntry>>,
    /// Transactions seen on the network, served back on `getdata`.
    pending_txs: Mutex<HashMap<Sha256dHash, Transaction>>,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    shutdown: Notify,
    running: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PeerGroup {
    /// Create a peer group over the given chain and discovery source.
    pub fn new(
        params: Arc<NetworkParameters>,
        chain: Arc<FullPrunedBlockChain>,
        discovery: PeerDiscovery,
        config: PeerGroupConfig,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(1000);
        Arc::new(Self {
            params,
            chain,
            config: RwLock::new(config),
            discovery,
            peers: Arc::new(DashMap::new()),
            pool: Mutex::new(AddressPool::new()),
            download_peer: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            broadcasts: Mutex::new(HashMap::new()),
            pending_txs: Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        })
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn PeerGroupListener>) {
        self.listeners.write().push(listener);
    }

    /// Change the outbound connection target at runtime.
    pub fn set_max_connections(&self, max_connections: usize) {
        self.config.write().max_connections = max_connections;
    }

    /// Number of peers past the handshake.
    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.lifecycle() == PeerLifecycle::Connected)
            .count()
    }

    /// The peer currently authoritative for block download.
    pub fn download_peer(&self) -> Option<Arc<Peer>> {
        let id = (*self.download_peer.read())?;
        self.peers.get(&id).map(|r| r.value().clone())
    }

    /// Seed the candidate pool with known addresses.
    pub fn add_address(&self, addr: SocketAddr) {
        self.pool.lock().add(addr);
    }

    /// Start the supervisor. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self
            .event_rx
            .lock()
            .take()
            .expect("peer group can only be started once");
        let group = self.clone();
        let handle = tokio::spawn(group.run(events));
        *self.supervisor.lock() = Some(handle);
    }

    /// Stop: close every peer, cancel pending dials, drain the supervisor.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Dropping the handles drops the outboxes, which ends the tasks.
        self.peers.clear();
        info!("Peer group stopped");
    }

    /// Announce a transaction to every connected peer and serve the
    /// resulting `getdata` requests. Completes once
    /// `min_broadcast_connections` peers have requested it, fails with
    /// [`NetworkError::BroadcastTimeout`] otherwise.
    pub async fn broadcast_transaction(&self, tx: Transaction) -> NetworkResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(NetworkError::NotRunning);
        }
        let hash = tx.hash();
        let (needed, timeout) = {
            let config = self.config.read();
            (config.min_broadcast_connections, config.broadcast_timeout)
        };
        let (done_tx, done_rx) = oneshot::channel();
        self.broadcasts.lock().insert(
            hash,
            BroadcastEntry {
                tx,
                requested: HashSet::new(),
                needed,
                done: Some(done_tx),
            },
        );

        let peers: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|p| p.lifecycle() == PeerLifecycle::Connected)
            .map(|r| r.value().clone())
            .collect();
        info!(tx = %hash, peers = peers.len(), needed, "Broadcasting transaction");
        for peer in peers {
            let _ = peer.send(Message::Inv(vec![InventoryItem::tx(hash)])).await;
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(count)) => {
                debug!(tx = %hash, count, "Broadcast complete");
                Ok(())
            }
            _ => {
                let got = self
                    .broadcasts
                    .lock()
                    .remove(&hash)
                    .map(|entry| entry.requested.len())
                    .unwrap_or(0);
                Err(NetworkError::BroadcastTimeout { got, needed })
            }
        }
    }

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        let discovered = self.discovery.discover().await;
        self.pool.lock().add_all(discovered);

        let mut connect_timer = tokio::time::interval(CONNECT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }

                _ = connect_timer.tick() => {
                    self.fill_connections();
                }
            }
        }
        debug!("Supervisor drained");
    }

    /// Open dials until the connected+dialing count reaches the target.
    fn fill_connections(self: &Arc<Self>) {
        let target = self.config.read().max_connections;
        let mut active = self.peers.len();
        if active >= target {
            return;
        }

        let mut pool = self.pool.lock();
        while active < target {
            let peers = self.peers.clone();
            let Some(addr) = pool.next_candidate(&move |a| peers.contains_key(a)) else {
                break;
            };
            self.spawn_connect(addr);
            active += 1;
        }
    }

    fn spawn_connect(self: &Arc<Self>, addr: SocketAddr) {
        debug!(addr = %addr, "Dialing peer");
        let (peer, outbox_rx) = Peer::new(addr, true);
        self.peers.insert(addr, peer.clone());

        let group = self.clone();
        tokio::spawn(async move {
            let config = group.config.read().clone();
            match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let version = group.build_version(addr);
                    run_connection(
                        stream,
                        peer,
                        group.params.packet_magic,
                        version,
                        config,
                        outbox_rx,
                        group.event_tx.clone(),
                    )
                    .await;
                }
                Ok(Err(e)) => {
                    let _ = group
                        .event_tx
                        .send(PeerEvent::ConnectFailed {
                            addr,
                            error: e.to_string(),
                        })
                        .await;
                }
                Err(_) => {
                    let _ = group
                        .event_tx
                        .send(PeerEvent::ConnectFailed {
                            addr,
                            error: "connect timed out".to_string(),
                        })
                        .await;
                }
            }
        });
    }

    fn build_version(&self, remote: SocketAddr) -> VersionMessage {
        let config = self.config.read();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp,
            receiver: PeerAddress::from_socket(remote),
            sender: PeerAddress::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                self.params.default_port,
            ),
            nonce: rand::random(),
            user_agent: config.wire_user_agent(),
            start_height: self.chain.height().unwrap_or(0),
            relay: true,
        }
    }

    async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer } => {
                self.pool.lock().note_success(peer);
                let Some(handle) = self.peers.get(&peer).map(|r| r.value().clone()) else {
                    return;
                };
                info!(
                    peer = %peer,
                    height = handle.best_height(),
                    count = self.connected_peer_count(),
                    "Peer connected"
                );
                let count = self.connected_peer_count();
                for listener in self.listeners.read().iter() {
                    listener.on_peer_connected(&handle, count);
                }
                self.elect_download_peer();
                self.maybe_request_blocks().await;
            }

            PeerEvent::Disconnected { peer } => {
                let removed = self.peers.remove(&peer).map(|(_, p)| p);
                if let Some(handle) = removed {
                    let count = self.connected_peer_count();
                    info!(peer = %peer, count, "Peer disconnected");
                    for listener in self.listeners.read().iter() {
                        listener.on_peer_disconnected(&handle, count);
                    }
                }
                let was_download = *self.download_peer.read() == Some(peer);
                if was_download {
                    self.elect_download_peer();
                    self.maybe_request_blocks().await;
                }
            }

            PeerEvent::ConnectFailed { addr, error } => {
                debug!(addr = %addr, error = %error, "Connection attempt failed");
                self.peers.remove(&addr);
                self.pool.lock().note_failure(addr);
            }

            PeerEvent::Message { peer, message } => {
                let Some(handle) = self.peers.get(&peer).map(|r| r.value().clone()) else {
                    return;
                };
                self.handle_message(handle, message).await;
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, peer: Arc<Peer>, message: Message) {
        match message {
            Message::Block(block) => {
                let hash = block.hash();
                let is_download_peer = *self.download_peer.read() == Some(peer.id());
                if !is_download_peer {
                    // Announcements from observers raise their height
                    // estimate but do not drive the chain.
                    for listener in self.listeners.read().iter() {
                        listener.on_block_announced(&peer, &hash);
                    }
                    return;
                }
                match self.chain.add(block) {
                    Ok(connected) => {
                        if connected {
                            peer.announce_height(self.chain.height().unwrap_or(0));
                        }
                        if peer.pending_block_count() == 0 {
                            self.maybe_request_blocks().await;
                        }
                    }
                    Err(ChainError::Store(e)) => {
                        warn!(error = %e, "Store failure, stopping block acceptance");
                    }
                    Err(e) => {
                        warn!(peer = %peer.addr(), block = %hash, error = %e, "Invalid block, dropping peer");
                        self.peers.remove(&peer.id());
                    }
                }
            }

            Message::Tx(tx) => {
                let hash = tx.hash();
                self.pending_txs.lock().insert(hash, tx.clone());
                for listener in self.listeners.read().iter() {
                    listener.on_transaction(&peer, &tx);
                }
            }

            Message::Inv(items) => {
                // The peer task already issued getdata for fresh items;
                // block announcements may make this peer the better
                // download source.
                if items.iter().any(|i| i.kind == InvKind::Block) {
                    peer.announce_height(peer.best_height().saturating_add(1));
                    self.elect_download_peer();
                }
            }

            Message::GetData(items) => {
                self.serve_getdata(&peer, items).await;
            }

            Message::GetAddr => {
                let addresses = self.sample_addresses();
                let _ = peer.send(Message::Addr(addresses)).await;
            }

            Message::Addr(addresses) => {
                let mut pool = self.pool.lock();
                for address in addresses {
                    pool.add(address.socket_addr());
                }
            }

            Message::Mempool => {
                let items: Vec<InventoryItem> = self
                    .pending_txs
                    .lock()
                    .keys()
                    .map(|hash| InventoryItem::tx(*hash))
                    .collect();
                if !items.is_empty() {
                    let _ = peer.send(Message::Inv(items)).await;
                }
            }

            other => {
                debug!(peer = %peer.addr(), command = %other.command(), "Unhandled message");
            }
        }
    }

    /// Serve `getdata` requests from pending broadcasts and relayed
    /// transactions; anything else is answered with `notfound`.
    async fn serve_getdata(&self, peer: &Arc<Peer>, items: Vec<InventoryItem>) {
        let mut missing = Vec::new();
        for item in items {
            if item.kind != InvKind::Transaction {
                missing.push(item);
                continue;
            }

            let (tx, completed) = {
                let mut broadcasts = self.broadcasts.lock();
                if let Some(entry) = broadcasts.get_mut(&item.hash) {
                    entry.requested.insert(peer.id());
                    let completed = if entry.requested.len() >= entry.needed {
                        entry.done.take().map(|done| (done, entry.requested.len()))
                    } else {
                        None
                    };
                    (Some(entry.tx.clone()), completed)
                } else {
                    (self.pending_txs.lock().get(&item.hash).cloned(), None)
                }
            };

            if let Some((done, count)) = completed {
                let _ = done.send(count);
            }

            match tx {
                Some(tx) => {
                    let _ = peer.send(Message::Tx(tx)).await;
                }
                None => missing.push(item),
            }
        }

        if !missing.is_empty() {
            let _ = peer.send(Message::NotFound(missing)).await;
        }
    }

    fn sample_addresses(&self) -> Vec<PeerAddress> {
        self.peers
            .iter()
            .filter(|p| p.lifecycle() == PeerLifecycle::Connected)
            .take(GETADDR_SAMPLE)
            .map(|p| PeerAddress::from_socket(p.addr()))
            .collect()
    }

    /// Pick the connected peer with the greatest announced height, ties
    /// broken by lowest ping.
    fn elect_download_peer(&self) {
        let best = self
            .peers
            .iter()
            .filter(|p| p.lifecycle() == PeerLifecycle::Connected)
            .max_by(|a, b| {
                a.best_height()
                    .cmp(&b.best_height())
                    .then_with(|| b.ping_time().cmp(&a.ping_time()))
            })
            .map(|p| p.id());

        let mut current = self.download_peer.write();
        if *current != best {
            debug!(peer = ?best, "Elected download peer");
            *current = best;
        }
    }

    /// Ask the download peer for more blocks when it is ahead of us.
    async fn maybe_request_blocks(&self) {
        let Some(peer) = self.download_peer() else {
            return;
        };
        let our_height = self.chain.height().unwrap_or(0);
        if peer.best_height() <= our_height {
            return;
        }
        let locator = self.block_locator();
        debug!(
            peer = %peer.addr(),
            our_height,
            their_height = peer.best_height(),
            "Requesting blocks"
        );
        let _ = peer
            .send(Message::GetBlocks(btc_protocol::GetBlocksMessage {
                version: PROTOCOL_VERSION,
                locator,
                stop: Sha256dHash::ZERO,
            }))
            .await;
    }

    /// Build a block locator: the last ten blocks densely, then strides
    /// doubling back to genesis.
    fn block_locator(&self) -> Vec<Sha256dHash> {
        let mut locator = Vec::new();
        let Ok(mut cursor) = self.chain.chain_head() else {
            return locator;
        };
        let store = self.chain.store();
        let mut step = 1u32;
        loop {
            locator.push(cursor.hash());
            if cursor.height == 0 {
                break;
            }
            if locator.len() >= 10 {
                step = step.saturating_mul(2);
            }
            // Walk `step` parents back, stopping at genesis.
            for _ in 0..step {
                if cursor.height == 0 {
                    break;
                }
                match store.get(&cursor.header.prev_hash) {
                    Ok(Some(parent)) => cursor = parent,
                    _ => return locator,
                }
            }
        }
        locator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_core::AcceptAllScripts;
    use btc_store::MemoryFullPrunedBlockStore;

    fn new_group() -> Arc<PeerGroup> {
        let params = Arc::new(NetworkParameters::unit_tests());
        let store = Arc::new(MemoryFullPrunedBlockStore::new(&params, 10));
        let chain = Arc::new(FullPrunedBlockChain::new(
            params.clone(),
            store,
            Arc::new(AcceptAllScripts),
        ));
        let discovery = PeerDiscovery::bootstrap_only(Vec::new(), params.default_port);
        PeerGroup::new(params, chain, discovery, PeerGroupConfig::default())
    }

    #[test]
    fn test_initial_state() {
        let group = new_group();
        assert_eq!(group.connected_peer_count(), 0);
        assert!(group.download_peer().is_none());
    }

    #[test]
    fn test_set_max_connections() {
        let group = new_group();
        group.set_max_connections(3);
        assert_eq!(group.config.read().max_connections, 3);
    }

    #[test]
    fn test_block_locator_starts_at_head() {
        let group = new_group();
        let locator = group.block_locator();
        assert_eq!(locator.len(), 1);
        assert_eq!(locator[0], group.params.genesis.hash());
    }

    #[tokio::test]
    async fn test_broadcast_requires_running() {
        let group = new_group();
        let result = group.broadcast_transaction(Transaction::new()).await;
        assert!(matches!(result, Err(NetworkError::NotRunning)));
    }

    #[test]
    fn test_version_message_shape() {
        let group = new_group();
        let version = group.build_version("127.0.0.1:8333".parse().unwrap());
        assert_eq!(version.version, PROTOCOL_VERSION);
        assert_eq!(version.start_height, 0);
        assert!(version.user_agent.starts_with("/btc-rust-node:"));
    }
}
