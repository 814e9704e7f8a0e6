//! # Outbound Ports
//!
//! Traits for external collaborators: the peer wire transport, DNS seeds,
//! the header store, durable persistence, and the wallet.

use crate::domain::{ChainParams, Hash, HeaderRecord, Peer, SpvError, Transaction};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message from a connected peer, already decoded by the wire layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// Version handshake completed.
    Handshake {
        /// Advertised service bits.
        services: u64,
        /// Peer's best height at connect time.
        start_height: u32,
    },
    /// Headers in answer to a `GetHeaders` request, ascending by height.
    Headers(Vec<HeaderRecord>),
    /// Peer announced a new block.
    BlockAnnounced {
        /// Height of the announced block.
        height: u32,
    },
    /// Peer relayed (inventoried) a transaction.
    TransactionRelayed(Hash),
    /// Peer gossiped addresses.
    Addresses(Vec<SocketAddr>),
    /// Link closed, with a reason if it failed.
    Closed(Option<String>),
}

/// Request to a connected peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerRequest {
    /// Ask for headers following the locator.
    GetHeaders {
        /// Block locator, newest first.
        locator: Vec<Hash>,
        /// First height expected in the reply.
        from_height: u32,
    },
    /// Broadcast a transaction.
    SendTransaction(Transaction),
    /// Close the link.
    Close,
}

/// Both halves of an open peer link.
#[derive(Debug)]
pub struct PeerChannel {
    /// Requests to the peer.
    pub requests: mpsc::UnboundedSender<PeerRequest>,
    /// Events from the peer.
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Peer wire transport - outbound port.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a link to `addr` speaking the network in `params`.
    ///
    /// The first event on a successful link is `PeerEvent::Handshake`.
    async fn open(&self, addr: SocketAddr, params: &ChainParams)
        -> Result<PeerChannel, SpvError>;
}

/// DNS seed resolution - outbound port.
#[async_trait]
pub trait SeedResolver: Send + Sync {
    /// Resolve `seed` into peer addresses using `port`.
    async fn resolve(&self, seed: &str, port: u16) -> Result<Vec<SocketAddr>, SpvError>;
}

/// Hash-indexed header store - outbound port.
///
/// Only the sync coordinator writes to it, from the manager's worker.
pub trait HeaderIndex: Send {
    /// Header by hash.
    fn get(&self, hash: &Hash) -> Option<HeaderRecord>;

    /// Insert (or replace) a header.
    fn insert(&mut self, header: HeaderRecord);

    /// Drop every header above `height`. Returns how many were removed.
    fn remove_above(&mut self, height: u32) -> usize;

    /// Highest stored header.
    fn tip(&self) -> Option<HeaderRecord>;

    /// Headers at or above `height`, ascending.
    fn headers_from(&self, height: u32) -> Vec<HeaderRecord>;

    /// Number of stored headers.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable storage callbacks - outbound port.
///
/// `replace = true` means the list is the complete new set; `false` means
/// it is an incremental addition.
pub trait PersistenceGateway: Send + Sync {
    /// Persist admitted headers.
    fn save_blocks(&self, replace: bool, blocks: &[HeaderRecord]);

    /// Persist known peer addresses.
    fn save_peers(&self, replace: bool, peers: &[Peer]);
}

/// Wallet collaborator - outbound port.
pub trait Wallet: Send + Sync {
    /// Record an outbound transaction before it is broadcast.
    fn register_transaction(&self, tx: &Transaction) -> Result<(), SpvError>;
}

/// Outbound collaborators of one peer manager.
pub struct ManagerPorts {
    /// Wire transport.
    pub transport: Arc<dyn PeerTransport>,
    /// DNS seed resolver.
    pub seeds: Arc<dyn SeedResolver>,
    /// Durable storage callbacks.
    pub persistence: Arc<dyn PersistenceGateway>,
    /// Header store, handed to the worker.
    pub index: Box<dyn HeaderIndex>,
}
