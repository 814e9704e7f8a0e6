//! # Peer Manager
//!
//! Single-worker actor tying the peer pool, sync coordinator and relay
//! together.
//!
//! ## Concurrency
//!
//! ```text
//! caller ──► PeerManager ──(mpsc)──► Worker task ──► PeerPool / SyncCoordinator / TransactionRelay
//!                 ▲                      │  ▲
//!                 │ snapshot (RwLock)    │  └── dial tasks, forwarders, timers (session-tagged)
//!                 └──────────────────────┘
//! ```
//!
//! All state mutation happens on the worker. Spawned tasks report back
//! through the same inbox, tagged with the session they belong to;
//! `disconnect()` bumps the session so stragglers are dropped and no
//! further events of the old session reach listeners.

use super::listener::{Listener, ListenerBus, SyncEvent};
use super::relay::{relay_count, PublishCallback, RelayLog, TransactionRelay};
use super::sync::SyncCoordinator;
use crate::config::PeerManagerConfig;
use crate::domain::{
    compute_sync_progress, ChainParams, ConnectStatus, ConnectionState, Hash, HeaderRecord, Peer,
    PeerPool, SpvError, SyncState, Transaction,
};
use crate::ports::{
    ManagerPorts, PeerChannel, PeerEvent, PeerManagerApi, PeerRequest, PeerTransport,
    PersistenceGateway, SeedResolver, Wallet,
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Distinct start heights remembered for progress reporting.
const MAX_PROGRESS_MARKS: usize = 64;

/// Work handed to the worker.
enum ManagerMessage {
    Connect,
    Disconnect,
    Rescan,
    SetFixedPeer(Option<SocketAddr>),
    Publish {
        session: u64,
        tx: Transaction,
        callback: PublishCallback,
    },
    Shutdown,
    SeedsResolved {
        session: u64,
        result: Result<Vec<SocketAddr>, SpvError>,
    },
    Connected {
        session: u64,
        addr: SocketAddr,
        channel: PeerChannel,
    },
    ConnectFailed {
        session: u64,
        addr: SocketAddr,
        error: String,
    },
    Peer {
        session: u64,
        addr: SocketAddr,
        event: PeerEvent,
    },
    PublishTimeout {
        session: u64,
        hash: Hash,
    },
    RetryConnect {
        session: u64,
    },
    HandshakeTimeout {
        session: u64,
        addr: SocketAddr,
        link: u64,
    },
}

/// Query-side view, written by the worker.
#[derive(Clone, Debug)]
struct SyncSnapshot {
    last_height: u64,
    last_timestamp: u64,
    estimated_height: u64,
    peer_count: usize,
    download_peer: Option<SocketAddr>,
    fixed_peer: Option<SocketAddr>,
    status: ConnectStatus,
    rescan_epoch: u64,
}

impl SyncSnapshot {
    fn new(state: &SyncState) -> Self {
        Self {
            last_height: u64::from(state.last_validated_height),
            last_timestamp: u64::from(state.last_validated_timestamp),
            estimated_height: state.estimated_network_height,
            peer_count: 0,
            download_peer: None,
            fixed_peer: None,
            status: ConnectStatus::Disconnected,
            rescan_epoch: 0,
        }
    }

    fn clear_peers(&mut self) {
        self.peer_count = 0;
        self.download_peer = None;
        self.status = ConnectStatus::Disconnected;
    }
}

/// Highest progress reported per start height, reset by rescan.
#[derive(Default)]
struct ProgressMarks {
    epoch: u64,
    marks: HashMap<u64, f64>,
}

struct Shared {
    snapshot: RwLock<SyncSnapshot>,
    progress: Mutex<ProgressMarks>,
    /// Current session; bumped by `disconnect()`.
    session: AtomicU64,
    disposed: AtomicBool,
    /// Held while dispatching and while bumping the session.
    gate: ReentrantMutex<()>,
    listeners: ListenerBus,
    relay_log: RelayLog,
}

/// Handle to a running peer manager.
///
/// Dropping the handle shuts the worker down.
pub struct PeerManager {
    inbox: mpsc::UnboundedSender<ManagerMessage>,
    shared: Arc<Shared>,
    params: Arc<ChainParams>,
}

impl PeerManager {
    /// Start a peer manager on the current tokio runtime.
    ///
    /// Fails with `SpvError::Lifecycle` outside a runtime and with
    /// `SpvError::InvalidChainParams` for malformed parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        params: Arc<ChainParams>,
        config: PeerManagerConfig,
        ports: ManagerPorts,
        wallet: Arc<dyn Wallet>,
        earliest_key_time: f64,
        initial_blocks: Vec<HeaderRecord>,
        initial_peers: Vec<Peer>,
    ) -> Result<Self, SpvError> {
        let runtime = Handle::try_current()
            .map_err(|_| SpvError::Lifecycle("peer manager needs a tokio runtime".to_string()))?;

        let ManagerPorts {
            transport,
            seeds,
            persistence,
            index,
        } = ports;
        let sync = SyncCoordinator::new(
            params.clone(),
            &config,
            index,
            initial_blocks,
            earliest_key_time,
        )?;
        let relay = TransactionRelay::new(config.min_relay_count, config.relay_cache_size);

        let shared = Arc::new(Shared {
            snapshot: RwLock::new(SyncSnapshot::new(sync.state())),
            progress: Mutex::new(ProgressMarks::default()),
            session: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            gate: ReentrantMutex::new(()),
            listeners: ListenerBus::new(),
            relay_log: relay.relay_log(),
        });

        let (inbox, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            params: params.clone(),
            config,
            transport,
            seeds,
            persistence,
            wallet,
            shared: shared.clone(),
            inbox: inbox.clone(),
            pool: PeerPool::new(initial_peers),
            sync,
            relay,
            links: HashMap::new(),
            next_link_id: 0,
            tasks: Vec::new(),
            session: 0,
            active: false,
            syncing: false,
            resolving: false,
            seeds_tried: false,
            retry_scheduled: false,
            failures: 0,
            rescan_epoch: 0,
        };
        runtime.spawn(worker.run(rx));
        info!(network = %params.name, "peer manager started");

        Ok(Self {
            inbox,
            shared,
            params,
        })
    }

    /// Stop the worker. Pending publishes fail as cancelled; every later
    /// call fails with `SpvError::Lifecycle`.
    pub fn shutdown(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bump_session();
        let _ = self.inbox.send(ManagerMessage::Shutdown);
    }

    /// Chain parameters this manager runs with.
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn ensure_live(&self) -> Result<(), SpvError> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(lifecycle("peer manager disposed"));
        }
        Ok(())
    }

    fn send(&self, message: ManagerMessage) -> Result<(), SpvError> {
        const STOPPED: &str = "peer manager worker stopped";
        self.inbox.send(message).map_err(|mpsc::error::SendError(message)| {
            if let ManagerMessage::Publish { callback, .. } = message {
                callback(Err(lifecycle(STOPPED)));
            }
            lifecycle(STOPPED)
        })
    }

    fn bump_session(&self) -> u64 {
        let _gate = self.shared.gate.lock();
        let mut snapshot = self.shared.snapshot.write();
        snapshot.clear_peers();
        self.shared.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read<T>(&self, f: impl FnOnce(&SyncSnapshot) -> T) -> Result<T, SpvError> {
        self.ensure_live()?;
        Ok(f(&self.shared.snapshot.read()))
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PeerManagerApi for PeerManager {
    fn connect(&self) -> Result<(), SpvError> {
        self.ensure_live()?;
        self.send(ManagerMessage::Connect)
    }

    fn disconnect(&self) -> Result<(), SpvError> {
        self.ensure_live()?;
        let session = self.bump_session();
        debug!(session, "disconnect requested");
        self.send(ManagerMessage::Disconnect)
    }

    fn rescan(&self) -> Result<(), SpvError> {
        self.ensure_live()?;
        self.send(ManagerMessage::Rescan)
    }

    fn use_fixed_peer(&self, host: &str, port: u16) -> Result<bool, SpvError> {
        self.ensure_live()?;
        let fixed = match parse_fixed_peer(host, port, self.params.standard_port) {
            Ok(fixed) => fixed,
            Err(e) => {
                debug!(error = %e, "rejected fixed peer");
                return Ok(false);
            }
        };
        self.shared.snapshot.write().fixed_peer = fixed;
        self.send(ManagerMessage::SetFixedPeer(fixed))?;
        Ok(true)
    }

    fn current_peer_name(&self) -> Result<String, SpvError> {
        self.read(|s| {
            s.download_peer
                .or(s.fixed_peer)
                .map(|addr| addr.to_string())
                .unwrap_or_default()
        })
    }

    fn download_peer_name(&self) -> Result<String, SpvError> {
        self.read(|s| s.download_peer.map(|addr| addr.to_string()).unwrap_or_default())
    }

    fn estimated_block_height(&self) -> Result<u64, SpvError> {
        self.read(|s| s.estimated_height)
    }

    fn last_block_height(&self) -> Result<u64, SpvError> {
        self.read(|s| s.last_height)
    }

    fn last_block_timestamp(&self) -> Result<u64, SpvError> {
        self.read(|s| s.last_timestamp)
    }

    fn sync_progress(&self, start_height: u64) -> Result<f64, SpvError> {
        let (progress, epoch) = self.read(|s| {
            (
                compute_sync_progress(s.last_height, s.estimated_height, start_height),
                s.rescan_epoch,
            )
        })?;
        let mut marks = self.shared.progress.lock();
        if marks.epoch != epoch {
            marks.epoch = epoch;
            marks.marks.clear();
        }
        if marks.marks.len() >= MAX_PROGRESS_MARKS && !marks.marks.contains_key(&start_height) {
            marks.marks.clear();
        }
        let mark = marks.marks.entry(start_height).or_insert(progress);
        *mark = mark.max(progress);
        Ok(*mark)
    }

    fn peer_count(&self) -> Result<usize, SpvError> {
        self.read(|s| s.peer_count)
    }

    fn connect_status(&self) -> Result<ConnectStatus, SpvError> {
        self.read(|s| s.status)
    }

    fn publish_transaction(
        &self,
        tx: Transaction,
        callback: PublishCallback,
    ) -> Result<(), SpvError> {
        if let Err(e) = self.ensure_live() {
            callback(Err(lifecycle("peer manager disposed")));
            return Err(e);
        }
        if tx.payload.is_empty() {
            callback(Err(SpvError::InvalidTransaction(
                "empty transaction payload".to_string(),
            )));
            return Ok(());
        }
        let session = self.shared.session.load(Ordering::SeqCst);
        if self.shared.snapshot.read().peer_count == 0 {
            callback(Err(SpvError::NoPeersConnected));
            return Ok(());
        }
        self.send(ManagerMessage::Publish {
            session,
            tx,
            callback,
        })
    }

    fn relay_count(&self, hash: &Hash) -> Result<u64, SpvError> {
        self.ensure_live()?;
        Ok(relay_count(&self.shared.relay_log, hash))
    }

    fn install_listener(&self, listener: Arc<dyn Listener>) -> Result<(), SpvError> {
        self.ensure_live()?;
        self.shared.listeners.install(listener);
        Ok(())
    }
}

/// An open peer link.
struct Link {
    id: u64,
    requests: mpsc::UnboundedSender<PeerRequest>,
    forwarder: JoinHandle<()>,
}

/// State owned by the worker task.
struct Worker {
    params: Arc<ChainParams>,
    config: PeerManagerConfig,
    transport: Arc<dyn PeerTransport>,
    seeds: Arc<dyn SeedResolver>,
    persistence: Arc<dyn PersistenceGateway>,
    wallet: Arc<dyn Wallet>,
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedSender<ManagerMessage>,
    pool: PeerPool,
    sync: SyncCoordinator,
    relay: TransactionRelay,
    links: HashMap<SocketAddr, Link>,
    next_link_id: u64,
    /// Dial tasks and timers of the running session.
    tasks: Vec<JoinHandle<()>>,
    session: u64,
    /// `connect()` called and not yet undone by `disconnect()`.
    active: bool,
    /// Between `SyncStarted` and `SyncStopped`.
    syncing: bool,
    resolving: bool,
    seeds_tried: bool,
    retry_scheduled: bool,
    /// Consecutive connectivity failures, for backoff.
    failures: u32,
    rescan_epoch: u64,
}

impl Worker {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ManagerMessage>) {
        while let Some(message) = inbox.recv().await {
            if !self.handle(message) {
                break;
            }
        }
        debug!(network = %self.params.name, "peer manager worker stopped");
    }

    /// Returns `false` once the worker should stop.
    fn handle(&mut self, message: ManagerMessage) -> bool {
        match message {
            ManagerMessage::Connect => self.on_connect(),
            ManagerMessage::Disconnect => self.on_disconnect(),
            ManagerMessage::Rescan => self.on_rescan(),
            ManagerMessage::SetFixedPeer(addr) => self.pool.set_fixed_peer(addr),
            ManagerMessage::Publish {
                session,
                tx,
                callback,
            } => self.on_publish(session, tx, callback),
            ManagerMessage::Shutdown => {
                self.on_disconnect();
                return false;
            }
            ManagerMessage::SeedsResolved { session, result } if self.is_current(session) => {
                self.on_seeds_resolved(result)
            }
            ManagerMessage::Connected {
                session,
                addr,
                channel,
            } if self.is_current(session) => self.on_connected(addr, channel),
            ManagerMessage::ConnectFailed {
                session,
                addr,
                error,
            } if self.is_current(session) => self.on_connect_failed(addr, error),
            ManagerMessage::Peer {
                session,
                addr,
                event,
            } if self.is_current(session) => self.on_peer_event(addr, event),
            ManagerMessage::PublishTimeout { session, hash } if self.is_current(session) => {
                if self.relay.expire(&hash) {
                    self.emit(SyncEvent::TxPublished {
                        hash,
                        error: Some(SpvError::PublishTimeout(hex::encode(hash)).to_string()),
                    });
                }
            }
            ManagerMessage::RetryConnect { session } if self.is_current(session) => {
                self.retry_scheduled = false;
                self.seeds_tried = false;
                self.fill_connections();
            }
            ManagerMessage::HandshakeTimeout {
                session,
                addr,
                link,
            } if self.is_current(session) => self.on_handshake_timeout(addr, link),
            _ => debug!("dropping message from a previous session"),
        }
        true
    }

    fn is_current(&self, session: u64) -> bool {
        self.active
            && session == self.session
            && session == self.shared.session.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) {
        let _gate = self.shared.gate.lock();
        if self.shared.session.load(Ordering::SeqCst) != self.session {
            return;
        }
        self.shared.listeners.dispatch(&event);
    }

    fn publish_snapshot(&self) {
        let state = self.sync.state();
        let mut snapshot = self.shared.snapshot.write();
        snapshot.last_height = u64::from(state.last_validated_height);
        snapshot.last_timestamp = u64::from(state.last_validated_timestamp);
        snapshot.estimated_height = state.estimated_network_height;
        snapshot.rescan_epoch = self.rescan_epoch;
        if self.active && self.shared.session.load(Ordering::SeqCst) == self.session {
            snapshot.peer_count = self.pool.connected_count();
            snapshot.download_peer = self.pool.download_peer();
            snapshot.status = if snapshot.peer_count > 0 {
                ConnectStatus::Connected
            } else {
                ConnectStatus::Connecting
            };
        }
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn on_connect(&mut self) {
        if self.active {
            debug!("connect ignored, already connecting or connected");
            return;
        }
        self.session = self.shared.session.load(Ordering::SeqCst);
        self.active = true;
        self.failures = 0;
        self.seeds_tried = false;
        info!(network = %self.params.name, session = self.session, "connecting");
        self.publish_snapshot();
        self.fill_connections();
    }

    fn on_disconnect(&mut self) {
        for (_, link) in self.links.drain() {
            let _ = link.requests.send(PeerRequest::Close);
            link.forwarder.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.pool.disconnect_all();
        self.sync.set_download_peer(None);
        let cancelled = self.relay.cancel_all();
        if let Some(blocks) = self.sync.take_due_saves(true) {
            self.persistence.save_blocks(false, &blocks);
        }
        if self.active {
            info!(cancelled = cancelled.len(), "disconnected");
        }
        self.active = false;
        self.syncing = false;
        self.resolving = false;
        self.seeds_tried = false;
        self.retry_scheduled = false;
        self.failures = 0;
        self.publish_snapshot();
    }

    fn fill_connections(&mut self) {
        if !self.active {
            return;
        }
        let now = unix_now();
        let room = self
            .config
            .max_connect_count
            .saturating_sub(self.pool.active_count());
        let candidates = if room > 0 {
            self.pool.candidates(room, now)
        } else {
            Vec::new()
        };
        for addr in &candidates {
            if self.pool.transition(addr, ConnectionState::Connecting) {
                self.dial(*addr);
            }
        }

        let fixed = self.pool.fixed_peer().is_some();
        if !fixed && !self.seeds_tried && candidates.len() < room {
            self.resolve_seeds();
        } else if self.pool.active_count() == 0 && !self.resolving {
            self.degrade("no reachable peers".to_string());
        }
        self.publish_snapshot();
    }

    fn dial(&mut self, addr: SocketAddr) {
        debug!(peer = %addr, "dialing");
        let transport = self.transport.clone();
        let params = self.params.clone();
        let inbox = self.inbox.clone();
        let session = self.session;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let task = tokio::spawn(async move {
            let message = match tokio::time::timeout(timeout, transport.open(addr, &params)).await
            {
                Ok(Ok(channel)) => ManagerMessage::Connected {
                    session,
                    addr,
                    channel,
                },
                Ok(Err(e)) => ManagerMessage::ConnectFailed {
                    session,
                    addr,
                    error: e.to_string(),
                },
                Err(_) => ManagerMessage::ConnectFailed {
                    session,
                    addr,
                    error: "connect timed out".to_string(),
                },
            };
            let _ = inbox.send(message);
        });
        self.track(task);
    }

    fn resolve_seeds(&mut self) {
        self.seeds_tried = true;
        self.resolving = true;
        let seeds = self.params.dns_seeds.clone();
        let port = self.params.standard_port;
        let resolver = self.seeds.clone();
        let inbox = self.inbox.clone();
        let session = self.session;
        let task = tokio::spawn(async move {
            let mut found = Vec::new();
            let mut errors = Vec::new();
            for seed in &seeds {
                match resolver.resolve(seed, port).await {
                    Ok(addrs) => found.extend(addrs),
                    Err(e) => errors.push(e.to_string()),
                }
            }
            let result = if found.is_empty() && !errors.is_empty() {
                Err(SpvError::Connectivity(errors.join("; ")))
            } else {
                Ok(found)
            };
            let _ = inbox.send(ManagerMessage::SeedsResolved { session, result });
        });
        self.track(task);
    }

    fn on_seeds_resolved(&mut self, result: Result<Vec<SocketAddr>, SpvError>) {
        self.resolving = false;
        match result {
            Ok(addrs) => {
                let now = unix_now();
                let added = self
                    .pool
                    .learn(addrs.into_iter().map(|a| Peer::from_socket(a, now)), now);
                debug!(added = added.len(), "DNS seeds resolved");
                if !added.is_empty() {
                    self.persistence.save_peers(false, &added);
                }
            }
            Err(e) => warn!(error = %e, "DNS seed resolution failed"),
        }
        self.fill_connections();
    }

    fn degrade(&mut self, reason: String) {
        if self.retry_scheduled {
            return;
        }
        let delay = self.config.backoff_ms(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.retry_scheduled = true;
        warn!(reason = %reason, retry_in_ms = delay, "connectivity degraded");
        self.emit(SyncEvent::ConnectivityDegraded {
            reason,
            retry_in_ms: delay,
        });

        let inbox = self.inbox.clone();
        let session = self.session;
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = inbox.send(ManagerMessage::RetryConnect { session });
        });
        self.track(task);
    }

    fn on_connected(&mut self, addr: SocketAddr, channel: PeerChannel) {
        if self.pool.state(&addr) != Some(ConnectionState::Connecting) {
            let _ = channel.requests.send(PeerRequest::Close);
            return;
        }
        let PeerChannel {
            requests,
            mut events,
        } = channel;
        let inbox = self.inbox.clone();
        let session = self.session;
        let id = self.next_link_id;
        self.next_link_id += 1;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, PeerEvent::Closed(_));
                let message = ManagerMessage::Peer {
                    session,
                    addr,
                    event,
                };
                if inbox.send(message).is_err() || closed {
                    return;
                }
            }
            let _ = inbox.send(ManagerMessage::Peer {
                session,
                addr,
                event: PeerEvent::Closed(None),
            });
        });
        self.links.insert(
            addr,
            Link {
                id,
                requests,
                forwarder,
            },
        );

        let inbox = self.inbox.clone();
        let deadline = Duration::from_millis(self.config.connect_timeout_ms);
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = inbox.send(ManagerMessage::HandshakeTimeout {
                session,
                addr,
                link: id,
            });
        });
        self.track(task);
    }

    fn on_handshake_timeout(&mut self, addr: SocketAddr, link: u64) {
        let pending = self.links.get(&addr).is_some_and(|l| l.id == link)
            && self.pool.state(&addr) == Some(ConnectionState::Connecting);
        if !pending {
            return;
        }
        warn!(peer = %addr, "no handshake before the deadline, dropping");
        self.drop_link(&addr);
        self.on_connect_failed(addr, "handshake timed out".to_string());
    }

    fn on_connect_failed(&mut self, addr: SocketAddr, error: String) {
        debug!(peer = %addr, error = %error, "connect failed");
        if self.pool.fixed_peer() == Some(addr) {
            self.pool.mark_disconnected(&addr);
            self.publish_snapshot();
            if self.pool.active_count() == 0 {
                self.degrade(format!("fixed peer {addr} unreachable: {error}"));
            }
            return;
        }
        self.pool.remove(&addr);
        self.persistence.save_peers(true, &self.pool.known_peers());
        self.fill_connections();
        self.maybe_start_sync();
    }

    fn on_peer_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        match event {
            PeerEvent::Handshake {
                services,
                start_height,
            } => self.on_handshake(addr, services, start_height),
            PeerEvent::Headers(headers) => self.on_headers(addr, headers),
            PeerEvent::BlockAnnounced { height } => {
                self.pool.observe_height(&addr, height);
                if self.sync.observe_height(u64::from(height)) {
                    self.publish_snapshot();
                    if self.syncing {
                        return;
                    }
                    if self.pool.download_peer().is_some() {
                        self.request_headers();
                    } else {
                        self.maybe_start_sync();
                    }
                }
            }
            PeerEvent::TransactionRelayed(hash) => {
                if let Some(update) = self.relay.record_relay(&hash, addr) {
                    self.emit(SyncEvent::TxStatusUpdate {
                        hash,
                        relay_count: update.relay_count,
                    });
                    if update.completed {
                        self.emit(SyncEvent::TxPublished { hash, error: None });
                    }
                }
            }
            PeerEvent::Addresses(addrs) => {
                let now = unix_now();
                let added = self
                    .pool
                    .learn(addrs.into_iter().map(|a| Peer::from_socket(a, now)), now);
                if !added.is_empty() {
                    self.persistence.save_peers(false, &added);
                    self.fill_connections();
                }
            }
            PeerEvent::Closed(reason) => self.on_peer_lost(addr, reason),
        }
    }

    fn on_handshake(&mut self, addr: SocketAddr, services: u64, start_height: u32) {
        let required = self.params.services;
        if services & required != required {
            debug!(peer = %addr, services, "peer lacks required services");
            self.drop_link(&addr);
            self.pool.mark_disconnected(&addr);
            self.pool.remove(&addr);
            self.fill_connections();
            return;
        }
        if !self.pool.mark_connected(&addr, services, start_height, unix_now()) {
            return;
        }
        self.failures = 0;
        self.sync.observe_height(u64::from(start_height));
        info!(peer = %addr, start_height, "peer connected");
        self.publish_snapshot();
        self.emit(SyncEvent::PeerConnected {
            peer: addr.to_string(),
        });
        self.maybe_start_sync();
    }

    fn maybe_start_sync(&mut self) {
        if !self.active || self.pool.download_peer().is_some() {
            return;
        }
        // Wait for pending dials so the best peer gets picked.
        if self.pool.active_count() > self.pool.connected_count() {
            return;
        }
        let Some(peer) = self.pool.select_download_peer(unix_now()) else {
            return;
        };
        self.sync.set_download_peer(Some(peer));
        info!(peer = %peer, "download peer selected");
        self.publish_snapshot();
        self.request_headers();
    }

    fn request_headers(&mut self) {
        let Some(peer) = self.pool.download_peer() else {
            return;
        };
        if self.sync.is_synced() {
            self.finish_sync(None);
            return;
        }
        if !self.syncing {
            self.syncing = true;
            self.emit(SyncEvent::SyncStarted);
        }
        let from_height = self.sync.state().last_validated_height.saturating_add(1);
        let locator = self.sync.locator();
        if let Some(link) = self.links.get(&peer) {
            debug!(peer = %peer, from_height, "requesting headers");
            let _ = link.requests.send(PeerRequest::GetHeaders {
                locator,
                from_height,
            });
        }
    }

    fn finish_sync(&mut self, error: Option<String>) {
        if let Some(blocks) = self.sync.take_due_saves(true) {
            self.persistence.save_blocks(false, &blocks);
        }
        if self.syncing {
            self.syncing = false;
            info!(
                height = self.sync.state().last_validated_height,
                error = ?error,
                "sync stopped"
            );
            self.emit(SyncEvent::SyncStopped { error });
        }
    }

    fn on_headers(&mut self, addr: SocketAddr, headers: Vec<HeaderRecord>) {
        if self.pool.download_peer() != Some(addr) {
            debug!(peer = %addr, "ignoring headers from a peer other than the download peer");
            return;
        }
        let empty = headers.is_empty();
        match self.sync.ingest(headers) {
            Ok(admitted) => {
                if let Some(blocks) = self.sync.take_due_saves(false) {
                    self.persistence.save_blocks(false, &blocks);
                }
                self.publish_snapshot();
                if admitted > 0 {
                    let state = self.sync.state();
                    self.emit(SyncEvent::SyncProgress {
                        last_height: u64::from(state.last_validated_height),
                        estimated_height: state.estimated_network_height,
                    });
                }
                if self.sync.is_synced() {
                    self.finish_sync(None);
                } else if empty || admitted == 0 {
                    self.on_stalled(addr);
                } else {
                    self.request_headers();
                }
            }
            Err(e) if e.is_protocol_violation() => self.on_misbehavior(addr, e),
            Err(e) => {
                warn!(peer = %addr, error = %e, "header batch not admitted");
                self.finish_sync(Some(e.to_string()));
            }
        }
    }

    /// The download peer answered without extending the chain while the
    /// estimate is still ahead. Hand the download to the next peer and stop
    /// counting the stalled peer's claim in the estimate.
    fn on_stalled(&mut self, addr: SocketAddr) {
        warn!(
            peer = %addr,
            height = self.sync.state().last_validated_height,
            estimated = self.sync.state().estimated_network_height,
            "download peer stalled below the estimate"
        );
        self.pool.mark_stalled(&addr);
        self.sync.set_download_peer(None);
        let serving = self.pool.best_serving_height().map_or(0, u64::from);
        self.sync.reset_estimate(serving);
        self.publish_snapshot();

        self.maybe_start_sync();
        if self.pool.download_peer().is_none() {
            self.finish_sync(None);
        }
    }

    fn on_misbehavior(&mut self, addr: SocketAddr, error: SpvError) {
        warn!(peer = %addr, error = %error, "peer misbehaved, dropping");
        self.drop_link(&addr);
        self.pool
            .mark_misbehaving(&addr, unix_now(), self.config.misbehavior_ban_secs);
        if self.sync.state().download_peer == Some(addr) {
            self.sync.set_download_peer(None);
        }
        self.persistence.save_peers(true, &self.pool.known_peers());
        self.publish_snapshot();
        self.emit(SyncEvent::PeerMisbehaved {
            peer: addr.to_string(),
            reason: error.to_string(),
        });

        self.maybe_start_sync();
        if self.pool.download_peer().is_none() {
            self.finish_sync(Some(error.to_string()));
        }
        self.fill_connections();
    }

    fn on_peer_lost(&mut self, addr: SocketAddr, reason: Option<String>) {
        let Some(link) = self.links.remove(&addr) else {
            return;
        };
        link.forwarder.abort();
        let was_connected = self.pool.state(&addr).is_some_and(|s| s.is_connected());
        let was_download = self.pool.download_peer() == Some(addr);
        self.pool.mark_disconnected(&addr);
        if was_download {
            self.sync.set_download_peer(None);
        }
        debug!(peer = %addr, reason = ?reason, "peer link closed");
        self.publish_snapshot();
        if was_connected {
            self.emit(SyncEvent::PeerDisconnected {
                peer: addr.to_string(),
            });
        }

        if was_download {
            self.maybe_start_sync();
            if self.pool.download_peer().is_none() {
                let reason = reason.unwrap_or_else(|| "download peer disconnected".to_string());
                self.finish_sync(Some(SpvError::Transport(reason).to_string()));
            }
        }
        self.fill_connections();
        self.maybe_start_sync();
    }

    fn drop_link(&mut self, addr: &SocketAddr) {
        if let Some(link) = self.links.remove(addr) {
            let _ = link.requests.send(PeerRequest::Close);
            link.forwarder.abort();
        }
    }

    fn on_publish(&mut self, session: u64, tx: Transaction, callback: PublishCallback) {
        let hash = tx.hash;
        if !self.is_current(session) {
            callback(Err(SpvError::PublishCancelled(hex::encode(hash))));
            return;
        }
        let peers = self.pool.connected();
        if peers.is_empty() {
            callback(Err(SpvError::NoPeersConnected));
            return;
        }
        if let Err(e) = self.wallet.register_transaction(&tx) {
            callback(Err(e));
            return;
        }
        if let Err(callback) = self.relay.begin(hash, callback) {
            callback(Err(SpvError::InvalidTransaction(format!(
                "{} is already being published",
                hex::encode(hash)
            ))));
            return;
        }

        for peer in &peers {
            if let Some(link) = self.links.get(peer) {
                let _ = link.requests.send(PeerRequest::SendTransaction(tx.clone()));
            }
        }
        info!(tx = %hex::encode(hash), peers = peers.len(), "transaction broadcast");

        let inbox = self.inbox.clone();
        let session = self.session;
        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(ManagerMessage::PublishTimeout { session, hash });
        });
        self.track(task);
    }

    fn on_rescan(&mut self) {
        let estimate = self.pool.best_height().map_or(0, u64::from);
        let retained = match self.sync.rescan(estimate) {
            Ok(retained) => retained,
            Err(e) => {
                warn!(error = %e, "rescan failed");
                return;
            }
        };
        self.persistence.save_blocks(true, &retained);
        self.persistence.save_peers(true, &self.pool.known_peers());
        self.pool.clear_stalls();
        self.rescan_epoch += 1;
        self.publish_snapshot();

        if self.pool.download_peer().is_some() {
            self.request_headers();
        } else {
            self.maybe_start_sync();
        }
    }
}

/// Parse a fixed peer override. `("", 0)` clears it; port 0 selects
/// `standard_port`.
fn parse_fixed_peer(
    host: &str,
    port: u16,
    standard_port: u16,
) -> Result<Option<SocketAddr>, SpvError> {
    if host.is_empty() && port == 0 {
        return Ok(None);
    }
    let ip: IpAddr = host
        .parse()
        .map_err(|_| SpvError::InvalidPeerAddress(format!("{host:?} is not an IP address")))?;
    let port = if port == 0 { standard_port } else { port };
    Ok(Some(SocketAddr::new(ip, port)))
}

fn lifecycle(reason: &str) -> SpvError {
    SpvError::Lifecycle(reason.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
