//! # Test Support
//!
//! Deterministic chains and scripted collaborators for exercising the peer
//! manager without a network. Available to this crate's tests and, with the
//! `test-utils` feature, to downstream crates.

use crate::adapters::{MemoryHeaderIndex, MemoryPersistence};
use crate::application::{Listener, SyncEvent};
use crate::domain::{
    ChainParams, Checkpoint, DifficultyRule, Hash, HeaderRecord, SpvError, Transaction,
};
use crate::ports::{
    ManagerPorts, PeerChannel, PeerEvent, PeerRequest, PeerTransport, SeedResolver, Wallet,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Target every generated header carries.
pub const TEST_TARGET: u32 = 0x1e00ffff;

/// Port of the test network.
pub const TEST_PORT: u16 = 7342;

/// Timestamp of the generated genesis header.
pub const TEST_GENESIS_TIME: u32 = 1_000_000;

/// Deterministic hash for `height`, valid proof of work at [`TEST_TARGET`].
pub fn chain_hash(height: u32) -> Hash {
    let mut hash = [0u8; 32];
    hash[8] = 0x5a;
    hash[28..32].copy_from_slice(&height.to_be_bytes());
    hash
}

/// `count` linked headers starting at `start_height`, ten minutes apart.
pub fn build_chain(start_height: u32, count: usize, start_ts: u32, target: u32) -> Vec<HeaderRecord> {
    (0..count as u32)
        .map(|i| {
            let height = start_height + i;
            let previous = if height == 0 {
                [0u8; 32]
            } else {
                chain_hash(height - 1)
            };
            HeaderRecord::new(height, chain_hash(height), previous, start_ts + 600 * i, target)
        })
        .collect()
}

/// Headers `1..=tip` of the test chain (genesis comes from the checkpoint).
pub fn test_chain(tip: u32) -> Vec<HeaderRecord> {
    build_chain(0, tip as usize + 1, TEST_GENESIS_TIME, TEST_TARGET)
        .into_iter()
        .skip(1)
        .collect()
}

/// Network with a single genesis checkpoint at [`chain_hash`]`(0)`.
pub fn test_params() -> ChainParams {
    ChainParams {
        name: "testlocal".to_string(),
        dns_seeds: vec!["seed.testlocal.".to_string()],
        standard_port: TEST_PORT,
        magic_number: 0xfabf_b5da,
        services: 0,
        checkpoints: vec![Checkpoint::new(
            0,
            chain_hash(0),
            TEST_GENESIS_TIME,
            TEST_TARGET,
        )],
        difficulty: DifficultyRule::StandardRetarget,
        max_target: TEST_TARGET,
    }
}

/// `10.0.0.n` on the test port.
pub fn peer_addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], TEST_PORT))
}

/// Transaction with a recognisable hash.
pub fn test_transaction(tag: u8) -> Transaction {
    Transaction::new([tag; 32], vec![0x01, tag])
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Scripted behaviour of one simulated peer.
#[derive(Clone, Debug)]
pub struct MockPeer {
    /// Height announced in the handshake.
    pub start_height: u32,
    /// Service bits announced in the handshake.
    pub services: u64,
    /// Headers this peer serves.
    pub headers: Vec<HeaderRecord>,
    /// Headers per `Headers` reply.
    pub batch_size: usize,
    /// Answer `SendTransaction` with `TransactionRelayed`.
    pub relay_transactions: bool,
    /// Refuse connections.
    pub fail_connect: bool,
    /// Close the link after serving this height, then refuse reconnects.
    pub drop_after_height: Option<u32>,
    /// Addresses gossiped right after the handshake.
    pub gossip: Vec<SocketAddr>,
    /// Send the handshake once the link opens.
    pub handshake: bool,
}

impl MockPeer {
    /// Peer serving `headers`, announcing the last one's height.
    pub fn serving(headers: Vec<HeaderRecord>) -> Self {
        let start_height = headers.last().map_or(0, |h| h.height);
        Self {
            start_height,
            services: 1,
            headers,
            batch_size: 50,
            relay_transactions: true,
            fail_connect: false,
            drop_after_height: None,
            gossip: Vec::new(),
            handshake: true,
        }
    }

    /// Peer that refuses every connection.
    pub fn unreachable() -> Self {
        Self {
            fail_connect: true,
            ..Self::serving(Vec::new())
        }
    }

    /// Override the handshake height.
    pub fn with_start_height(mut self, height: u32) -> Self {
        self.start_height = height;
        self
    }

    /// Override the reply batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Close the link after serving `height`.
    pub fn dropping_after(mut self, height: u32) -> Self {
        self.drop_after_height = Some(height);
        self
    }

    /// Never relay transactions.
    pub fn silent(mut self) -> Self {
        self.relay_transactions = false;
        self
    }

    /// Accept the link but never complete the handshake.
    pub fn mute(mut self) -> Self {
        self.handshake = false;
        self
    }

    /// Gossip `addrs` after the handshake.
    pub fn gossiping(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.gossip = addrs;
        self
    }
}

#[derive(Default)]
struct NetworkState {
    peers: Mutex<HashMap<SocketAddr, MockPeer>>,
    requests: Mutex<Vec<(SocketAddr, PeerRequest)>>,
    opened: Mutex<Vec<SocketAddr>>,
}

/// In-process [`PeerTransport`] backed by [`MockPeer`] scripts.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<NetworkState>,
}

impl MockNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the peer at `addr`.
    pub fn add(&self, addr: SocketAddr, peer: MockPeer) {
        self.state.peers.lock().insert(addr, peer);
    }

    /// `from_height` of every `GetHeaders` sent to `addr`, in order.
    pub fn header_requests(&self, addr: SocketAddr) -> Vec<u32> {
        self.state
            .requests
            .lock()
            .iter()
            .filter_map(|(to, request)| match request {
                PeerRequest::GetHeaders { from_height, .. } if *to == addr => Some(*from_height),
                _ => None,
            })
            .collect()
    }

    /// Hashes of transactions sent to `addr`.
    pub fn transactions_sent(&self, addr: SocketAddr) -> Vec<Hash> {
        self.state
            .requests
            .lock()
            .iter()
            .filter_map(|(to, request)| match request {
                PeerRequest::SendTransaction(tx) if *to == addr => Some(tx.hash),
                _ => None,
            })
            .collect()
    }

    /// Successful link openings to `addr`.
    pub fn open_count(&self, addr: SocketAddr) -> usize {
        self.state.opened.lock().iter().filter(|a| **a == addr).count()
    }
}

#[async_trait]
impl PeerTransport for MockNetwork {
    async fn open(&self, addr: SocketAddr, _params: &ChainParams) -> Result<PeerChannel, SpvError> {
        let peer = self
            .state
            .peers
            .lock()
            .get(&addr)
            .cloned()
            .ok_or_else(|| SpvError::Connectivity(format!("no route to {addr}")))?;
        if peer.fail_connect {
            return Err(SpvError::Connectivity(format!("{addr} refused connection")));
        }
        self.state.opened.lock().push(addr);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(addr, peer, request_rx, event_tx, self.state.clone()));
        Ok(PeerChannel {
            requests: request_tx,
            events: event_rx,
        })
    }
}

async fn serve(
    addr: SocketAddr,
    peer: MockPeer,
    mut requests: mpsc::UnboundedReceiver<PeerRequest>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Arc<NetworkState>,
) {
    if !peer.handshake {
        // Keep the link open and unanswered until it is closed.
        while let Some(request) = requests.recv().await {
            let close = matches!(request, PeerRequest::Close);
            state.requests.lock().push((addr, request));
            if close {
                return;
            }
        }
        return;
    }
    let _ = events.send(PeerEvent::Handshake {
        services: peer.services,
        start_height: peer.start_height,
    });
    if !peer.gossip.is_empty() {
        let _ = events.send(PeerEvent::Addresses(peer.gossip.clone()));
    }

    while let Some(request) = requests.recv().await {
        state.requests.lock().push((addr, request.clone()));
        match request {
            PeerRequest::GetHeaders { from_height, .. } => {
                let limit = peer.drop_after_height.unwrap_or(u32::MAX);
                let batch: Vec<HeaderRecord> = peer
                    .headers
                    .iter()
                    .filter(|h| h.height >= from_height && h.height <= limit)
                    .take(peer.batch_size)
                    .cloned()
                    .collect();
                let exhausted = batch.last().map_or(true, |h| h.height >= limit);
                let _ = events.send(PeerEvent::Headers(batch));
                if peer.drop_after_height.is_some() && exhausted {
                    if let Some(script) = state.peers.lock().get_mut(&addr) {
                        script.fail_connect = true;
                    }
                    let _ = events.send(PeerEvent::Closed(Some("connection reset".to_string())));
                    return;
                }
            }
            PeerRequest::SendTransaction(tx) => {
                if peer.relay_transactions {
                    let _ = events.send(PeerEvent::TransactionRelayed(tx.hash));
                }
            }
            PeerRequest::Close => return,
        }
    }
}

/// [`SeedResolver`] with canned answers. Unknown seeds resolve to nothing.
#[derive(Default)]
pub struct MockSeeds {
    answers: Mutex<HashMap<String, Result<Vec<SocketAddr>, String>>>,
    lookups: AtomicUsize,
}

impl MockSeeds {
    /// Create a resolver with no answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `seed` to `addrs`.
    pub fn answer(&self, seed: &str, addrs: Vec<SocketAddr>) {
        self.answers.lock().insert(seed.to_string(), Ok(addrs));
    }

    /// Fail lookups of `seed`.
    pub fn fail(&self, seed: &str, reason: &str) {
        self.answers
            .lock()
            .insert(seed.to_string(), Err(reason.to_string()));
    }

    /// Lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeedResolver for MockSeeds {
    async fn resolve(&self, seed: &str, _port: u16) -> Result<Vec<SocketAddr>, SpvError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        match self.answers.lock().get(seed) {
            Some(Ok(addrs)) => Ok(addrs.clone()),
            Some(Err(reason)) => Err(SpvError::Connectivity(reason.clone())),
            None => Ok(Vec::new()),
        }
    }
}

/// [`Wallet`] recording registrations.
#[derive(Default)]
pub struct MockWallet {
    registered: Mutex<Vec<Hash>>,
    reject: AtomicBool,
}

impl MockWallet {
    /// Create an accepting wallet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every later registration.
    pub fn reject_all(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    /// Hashes registered so far.
    pub fn registered(&self) -> Vec<Hash> {
        self.registered.lock().clone()
    }
}

impl Wallet for MockWallet {
    fn register_transaction(&self, tx: &Transaction) -> Result<(), SpvError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SpvError::InvalidTransaction("rejected by wallet".to_string()));
        }
        self.registered.lock().push(tx.hash);
        Ok(())
    }
}

/// [`Listener`] keeping every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingListener {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Number of events received.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Whether any received event satisfies `predicate`.
    pub fn any(&self, predicate: impl Fn(&SyncEvent) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }
}

impl Listener for RecordingListener {
    fn on_event(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Ports wired to `network`, `seeds` and `persistence` over a fresh
/// in-memory header index.
pub fn test_ports(
    network: &MockNetwork,
    seeds: &Arc<MockSeeds>,
    persistence: &Arc<MemoryPersistence>,
) -> ManagerPorts {
    ManagerPorts {
        transport: Arc::new(network.clone()),
        seeds: seeds.clone(),
        persistence: persistence.clone(),
        index: Box::new(MemoryHeaderIndex::new()),
    }
}
