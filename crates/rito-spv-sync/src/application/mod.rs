//! # Application Layer
//!
//! The peer manager worker and the services it drives.

mod listener;
mod manager;
mod registry;
mod relay;
mod sync;

pub use listener::{Listener, ListenerBus, SyncEvent};
pub use manager::PeerManager;
pub use registry::{SessionHandle, SessionRegistry};
pub use relay::{
    relay_count, PublishCallback, PublishOutcome, RelayLog, RelayUpdate, TransactionRelay,
};
pub use sync::SyncCoordinator;
