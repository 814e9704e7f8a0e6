//! # Domain Entities
//!
//! Headers, peers and transactions as the peer manager sees them.

use super::errors::Hash;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Block header record (what an SPV client keeps per block).
///
/// The hash is computed by the wire layer; this crate never rehashes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderRecord {
    /// Block height.
    pub height: u32,
    /// Hash of this block.
    pub hash: Hash,
    /// Hash of the parent block.
    pub previous_hash: Hash,
    /// Unix timestamp (seconds).
    pub timestamp: u32,
    /// Proof-of-work target in compact encoding.
    pub target: u32,
    /// Block version.
    pub version: u32,
    /// Merkle root of transactions.
    pub merkle_root: Hash,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl HeaderRecord {
    /// Create a header record with zeroed proof-of-work fields.
    pub fn new(height: u32, hash: Hash, previous_hash: Hash, timestamp: u32, target: u32) -> Self {
        Self {
            height,
            hash,
            previous_hash,
            timestamp,
            target,
            version: 0,
            merkle_root: [0u8; 32],
            nonce: 0,
        }
    }

    /// Hex rendering of the hash, for logs.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Connection lifecycle of a single peer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Link being established.
    Connecting,
    /// Handshake complete.
    Connected,
    /// Serving headers as the download peer.
    Syncing,
    /// Caught violating the protocol; about to be dropped.
    Misbehaving,
}

impl ConnectionState {
    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Syncing)
                | (Connected, Misbehaving)
                | (Connected, Disconnected)
                | (Syncing, Connected)
                | (Syncing, Misbehaving)
                | (Syncing, Disconnected)
                | (Misbehaving, Disconnected)
        )
    }

    /// Connected or syncing.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Syncing)
    }
}

/// A known network peer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    /// IP address.
    pub address: IpAddr,
    /// TCP port.
    pub port: u16,
    /// Advertised service bits.
    pub services: u64,
    /// Last time the peer was seen (unix seconds).
    pub timestamp: u64,
    /// Current connection state.
    pub state: ConnectionState,
}

impl Peer {
    /// Create a disconnected peer.
    pub fn new(address: IpAddr, port: u16, services: u64, timestamp: u64) -> Self {
        Self {
            address,
            port,
            services,
            timestamp,
            state: ConnectionState::Disconnected,
        }
    }

    /// Create a peer from a socket address.
    pub fn from_socket(addr: SocketAddr, timestamp: u64) -> Self {
        Self::new(addr.ip(), addr.port(), 0, timestamp)
    }

    /// Socket address (the peer's identity).
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Display name, `host:port`.
    pub fn name(&self) -> String {
        self.socket_addr().to_string()
    }
}

/// Signed transaction handed in by the wallet (opaque to this crate).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction hash.
    pub hash: Hash,
    /// Serialized transaction.
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Create a transaction.
    pub fn new(hash: Hash, payload: Vec<u8>) -> Self {
        Self { hash, payload }
    }
}
