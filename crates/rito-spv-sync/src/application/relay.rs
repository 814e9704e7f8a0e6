//! # Transaction Relay
//!
//! Bookkeeping for outbound transactions: the pending publish callbacks and
//! the set of distinct peers seen relaying each transaction.
//!
//! Every callback fires exactly once: on reaching the minimum relay count,
//! on timeout, or on disconnect.

use crate::domain::{Hash, SpvError};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Terminal outcome of a publish: the relay count on success.
pub type PublishOutcome = Result<u64, SpvError>;

/// Callback receiving a publish outcome.
pub type PublishCallback = Box<dyn FnOnce(PublishOutcome) + Send>;

/// Relayers per transaction hash, shared with the query side.
pub type RelayLog = Arc<Mutex<LruCache<Hash, HashSet<SocketAddr>>>>;

/// Relay count change reported by [`TransactionRelay::record_relay`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayUpdate {
    /// Distinct relaying peers so far.
    pub relay_count: u64,
    /// Whether this relay completed a pending publish.
    pub completed: bool,
}

/// Pending publishes and relay counts.
pub struct TransactionRelay {
    /// Relays needed for success.
    min_relay_count: u64,
    /// Callbacks of publishes still waiting for relays.
    pending: HashMap<Hash, PublishCallback>,
    /// Relaying peers per published hash.
    relayers: RelayLog,
}

impl TransactionRelay {
    /// Create a relay tracker remembering up to `cache_size` transactions.
    pub fn new(min_relay_count: u64, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            min_relay_count: min_relay_count.max(1),
            pending: HashMap::new(),
            relayers: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Shared handle to the relay log, for lock-free-of-worker queries.
    pub fn relay_log(&self) -> RelayLog {
        self.relayers.clone()
    }

    /// Track a new publish. Hands the callback back if `hash` is already
    /// pending.
    pub fn begin(&mut self, hash: Hash, callback: PublishCallback) -> Result<(), PublishCallback> {
        if self.pending.contains_key(&hash) {
            return Err(callback);
        }
        {
            let mut log = self.relayers.lock();
            if !log.contains(&hash) {
                log.put(hash, HashSet::new());
            }
        }
        self.pending.insert(hash, callback);
        debug!(tx = %hex::encode(hash), "publish pending");
        Ok(())
    }

    /// Record that `peer` relayed `hash`.
    ///
    /// Returns `None` for transactions never published through this relay
    /// and for repeat relays by the same peer.
    pub fn record_relay(&mut self, hash: &Hash, peer: SocketAddr) -> Option<RelayUpdate> {
        let relay_count = {
            let mut log = self.relayers.lock();
            let relayers = log.get_mut(hash)?;
            if !relayers.insert(peer) {
                return None;
            }
            relayers.len() as u64
        };

        let completed = relay_count >= self.min_relay_count && self.complete(hash, Ok(relay_count));
        Some(RelayUpdate {
            relay_count,
            completed,
        })
    }

    /// Fail a pending publish with a timeout. Returns whether one was pending.
    pub fn expire(&mut self, hash: &Hash) -> bool {
        let error = SpvError::PublishTimeout(hex::encode(hash));
        let expired = self.complete(hash, Err(error));
        if expired {
            warn!(tx = %hex::encode(hash), "publish timed out");
        }
        expired
    }

    /// Fail every pending publish as cancelled. Returns their hashes.
    pub fn cancel_all(&mut self) -> Vec<Hash> {
        let hashes: Vec<Hash> = self.pending.keys().copied().collect();
        for hash in &hashes {
            self.complete(hash, Err(SpvError::PublishCancelled(hex::encode(hash))));
        }
        hashes
    }

    /// Distinct peers seen relaying `hash`, 0 if unknown.
    pub fn relay_count(&self, hash: &Hash) -> u64 {
        relay_count(&self.relayers, hash)
    }

    /// Whether `hash` is still waiting for relays.
    pub fn is_pending(&self, hash: &Hash) -> bool {
        self.pending.contains_key(hash)
    }

    /// Number of pending publishes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn complete(&mut self, hash: &Hash, outcome: PublishOutcome) -> bool {
        match self.pending.remove(hash) {
            Some(callback) => {
                callback(outcome);
                true
            }
            None => false,
        }
    }
}

/// Read a relay count from a shared log without touching LRU order.
pub fn relay_count(log: &RelayLog, hash: &Hash) -> u64 {
    log.lock().peek(hash).map_or(0, |relayers| relayers.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 7342))
    }

    fn recorder() -> (PublishCallback, mpsc::Receiver<PublishOutcome>) {
        let (tx, rx) = mpsc::channel();
        let callback: PublishCallback = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (callback, rx)
    }

    #[test]
    fn test_success_at_min_relay_count() {
        let mut relay = TransactionRelay::new(2, 16);
        let (callback, rx) = recorder();
        relay.begin([1u8; 32], callback).ok().unwrap();

        let first = relay.record_relay(&[1u8; 32], peer(1)).unwrap();
        assert_eq!(first, RelayUpdate { relay_count: 1, completed: false });
        assert!(relay.record_relay(&[1u8; 32], peer(1)).is_none());
        assert!(rx.try_recv().is_err());

        let second = relay.record_relay(&[1u8; 32], peer(2)).unwrap();
        assert!(second.completed);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 2);
        assert!(!relay.is_pending(&[1u8; 32]));

        // Counting continues after completion; the callback does not refire.
        let third = relay.record_relay(&[1u8; 32], peer(3)).unwrap();
        assert!(!third.completed);
        assert_eq!(relay.relay_count(&[1u8; 32]), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_transaction_ignored() {
        let mut relay = TransactionRelay::new(1, 16);
        assert!(relay.record_relay(&[9u8; 32], peer(1)).is_none());
        assert_eq!(relay.relay_count(&[9u8; 32]), 0);
    }

    #[test]
    fn test_duplicate_begin_rejected() {
        let mut relay = TransactionRelay::new(1, 16);
        let (first, _rx1) = recorder();
        let (second, _rx2) = recorder();
        assert!(relay.begin([1u8; 32], first).is_ok());
        assert!(relay.begin([1u8; 32], second).is_err());
    }

    #[test]
    fn test_expire_fires_once() {
        let mut relay = TransactionRelay::new(1, 16);
        let (callback, rx) = recorder();
        relay.begin([1u8; 32], callback).ok().unwrap();

        assert!(relay.expire(&[1u8; 32]));
        assert!(!relay.expire(&[1u8; 32]));
        assert!(matches!(rx.try_recv().unwrap(), Err(SpvError::PublishTimeout(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all() {
        let mut relay = TransactionRelay::new(1, 16);
        let (a, rx_a) = recorder();
        let (b, rx_b) = recorder();
        relay.begin([1u8; 32], a).ok().unwrap();
        relay.begin([2u8; 32], b).ok().unwrap();

        assert_eq!(relay.cancel_all().len(), 2);
        assert_eq!(relay.pending_count(), 0);
        assert!(matches!(rx_a.try_recv().unwrap(), Err(SpvError::PublishCancelled(_))));
        assert!(matches!(rx_b.try_recv().unwrap(), Err(SpvError::PublishCancelled(_))));
    }

    #[test]
    fn test_relay_log_bounded() {
        let mut relay = TransactionRelay::new(1, 2);
        for n in 0..3u8 {
            let (callback, _rx) = recorder();
            relay.begin([n; 32], callback).ok().unwrap();
            relay.record_relay(&[n; 32], peer(1));
        }
        assert_eq!(relay.relay_count(&[0u8; 32]), 0);
        assert_eq!(relay.relay_count(&[2u8; 32]), 1);
    }
}
