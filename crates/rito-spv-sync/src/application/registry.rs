//! # Session Registry
//!
//! Opaque handles for peer managers. A handle is a slot index plus a
//! generation; disposing a manager bumps the slot's generation, so stale
//! handles fail with `SpvError::Lifecycle` instead of reaching another
//! manager.

use super::manager::PeerManager;
use crate::config::PeerManagerConfig;
use crate::domain::{ChainParams, HeaderRecord, Peer, SpvError};
use crate::ports::{ManagerPorts, Wallet};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Opaque reference to a registered peer manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    manager: Option<Arc<PeerManager>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Handle table for peer managers.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Slots>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a peer manager and register it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        params: Arc<ChainParams>,
        config: PeerManagerConfig,
        ports: ManagerPorts,
        wallet: Arc<dyn Wallet>,
        earliest_key_time: f64,
        initial_blocks: Vec<HeaderRecord>,
        initial_peers: Vec<Peer>,
    ) -> Result<SessionHandle, SpvError> {
        let manager = PeerManager::spawn(
            params,
            config,
            ports,
            wallet,
            earliest_key_time,
            initial_blocks,
            initial_peers,
        )?;
        Ok(self.insert(Arc::new(manager)))
    }

    /// Register an already spawned manager.
    pub fn insert(&self, manager: Arc<PeerManager>) -> SessionHandle {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.manager = Some(manager);
        let handle = SessionHandle {
            index,
            generation: slot.generation,
        };
        debug!(?handle, "session created");
        handle
    }

    /// Manager behind `handle`.
    pub fn get(&self, handle: SessionHandle) -> Result<Arc<PeerManager>, SpvError> {
        let inner = self.inner.read();
        inner
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.manager.clone())
            .ok_or_else(|| stale(handle))
    }

    /// Shut down and unregister the manager behind `handle`.
    ///
    /// Clones of the manager obtained earlier keep existing, but every call
    /// on them fails with `SpvError::Lifecycle`.
    pub fn dispose(&self, handle: SessionHandle) -> Result<(), SpvError> {
        let manager = {
            let mut inner = self.inner.write();
            let slot = inner
                .slots
                .get_mut(handle.index as usize)
                .filter(|slot| slot.generation == handle.generation)
                .ok_or_else(|| stale(handle))?;
            let manager = slot.manager.take().ok_or_else(|| stale(handle))?;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(handle.index);
            manager
        };
        manager.shutdown();
        debug!(?handle, "session disposed");
        Ok(())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.slots.len() - inner.free.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stale(handle: SessionHandle) -> SpvError {
    SpvError::Lifecycle(format!(
        "session {}:{} is not live",
        handle.index, handle.generation
    ))
}
