//! # Listener Bus
//!
//! Ordered observer registration and synchronous event dispatch.
//!
//! Events are dispatched from the manager's worker, in registration order.
//! The listener list is cloned before dispatch so a listener may install
//! another listener without deadlocking.

use crate::domain::Hash;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle, progress and relay events.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// Header download started on a download peer.
    SyncStarted,
    /// Headers were admitted.
    SyncProgress {
        /// Height of the last admitted header.
        last_height: u64,
        /// Current network height estimate.
        estimated_height: u64,
    },
    /// Header download stopped, with an error if it did not complete.
    SyncStopped {
        /// Why sync stopped, if abnormally.
        error: Option<String>,
    },
    /// A peer completed its handshake.
    PeerConnected {
        /// Peer name, `host:port`.
        peer: String,
    },
    /// A connected peer went away.
    PeerDisconnected {
        /// Peer name, `host:port`.
        peer: String,
    },
    /// A peer was dropped for a protocol violation.
    PeerMisbehaved {
        /// Peer name, `host:port`.
        peer: String,
        /// The violation.
        reason: String,
    },
    /// No peer could be reached; a retry is scheduled.
    ConnectivityDegraded {
        /// What failed.
        reason: String,
        /// Delay before the next attempt.
        retry_in_ms: u64,
    },
    /// Relay count of a published transaction changed.
    TxStatusUpdate {
        /// Transaction hash.
        hash: Hash,
        /// Distinct relaying peers so far.
        relay_count: u64,
    },
    /// A publish reached its terminal outcome.
    TxPublished {
        /// Transaction hash.
        hash: Hash,
        /// Failure description, `None` on success.
        error: Option<String>,
    },
}

/// Observer of [`SyncEvent`]s.
pub trait Listener: Send + Sync {
    /// Handle one event. Called on the manager's worker; must not block.
    fn on_event(&self, event: &SyncEvent);
}

impl<F> Listener for F
where
    F: Fn(&SyncEvent) + Send + Sync,
{
    fn on_event(&self, event: &SyncEvent) {
        self(event)
    }
}

/// Ordered list of listeners.
#[derive(Default)]
pub struct ListenerBus {
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
    events_dispatched: AtomicU64,
}

impl ListenerBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn install(&self, listener: Arc<dyn Listener>) {
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        debug!(listeners = listeners.len(), "listener installed");
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Returns how many listeners received it.
    pub fn dispatch(&self, event: &SyncEvent) -> usize {
        let listeners: Vec<Arc<dyn Listener>> = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_event(event);
        }
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        listeners.len()
    }

    /// Number of installed listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is installed.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Events dispatched so far.
    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }
}
