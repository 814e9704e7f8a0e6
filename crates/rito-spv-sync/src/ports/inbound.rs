//! # Inbound Ports
//!
//! API trait defining what the SPV peer manager can do.
//!
//! Mutating calls hand work to the manager's worker and return without
//! waiting on the network. Queries read a snapshot. Every call on a
//! disposed manager fails with `SpvError::Lifecycle`.

use crate::application::{Listener, PublishCallback};
use crate::domain::{ConnectStatus, Hash, SpvError, Transaction};
use std::sync::Arc;

/// SPV peer manager API - inbound port.
pub trait PeerManagerApi: Send + Sync {
    /// Start connecting. No-op while already connecting or connected.
    fn connect(&self) -> Result<(), SpvError>;

    /// Drop every peer, cancel pending work, fail pending publishes.
    fn disconnect(&self) -> Result<(), SpvError>;

    /// Discard chain progress above the wallet's restart checkpoint and
    /// download headers again, keeping peer connections.
    fn rescan(&self) -> Result<(), SpvError>;

    /// Override discovery with a single peer. `port == 0` selects the
    /// network's standard port and `("", 0)` clears the override.
    ///
    /// Returns `false` when `host` is not an IP address.
    fn use_fixed_peer(&self, host: &str, port: u16) -> Result<bool, SpvError>;

    /// Download peer name, else the fixed peer name, else empty.
    fn current_peer_name(&self) -> Result<String, SpvError>;

    /// Download peer name, or empty.
    fn download_peer_name(&self) -> Result<String, SpvError>;

    /// Best height claimed by any peer.
    fn estimated_block_height(&self) -> Result<u64, SpvError>;

    /// Height of the last admitted header.
    fn last_block_height(&self) -> Result<u64, SpvError>;

    /// Timestamp of the last admitted header.
    fn last_block_timestamp(&self) -> Result<u64, SpvError>;

    /// Sync progress in `[0, 1]` relative to `start_height`.
    fn sync_progress(&self, start_height: u64) -> Result<f64, SpvError>;

    /// Number of peers that completed a handshake.
    fn peer_count(&self) -> Result<usize, SpvError>;

    /// Aggregate connection status.
    fn connect_status(&self) -> Result<ConnectStatus, SpvError>;

    /// Broadcast `tx`. `callback` fires exactly once with the outcome,
    /// also when the call itself fails: a disposed manager reports
    /// `SpvError::Lifecycle` both ways.
    fn publish_transaction(
        &self,
        tx: Transaction,
        callback: PublishCallback,
    ) -> Result<(), SpvError>;

    /// Distinct peers seen relaying `hash`, 0 if unknown.
    fn relay_count(&self, hash: &Hash) -> Result<u64, SpvError>;

    /// Register an observer. Observers are called in registration order.
    fn install_listener(&self, listener: Arc<dyn Listener>) -> Result<(), SpvError>;
}
