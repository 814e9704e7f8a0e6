//! # Rito SPV Sync
//!
//! Synchronization core of a simplified-payment-verification wallet client.
//!
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Track the current chain state and relay transactions without downloading
//! full blocks:
//! - Block headers only, admitted against trusted checkpoints and the
//!   periodic difficulty-retarget rule
//! - One download peer drives header sync, others stand by for rotation
//! - Outbound transactions are broadcast and their relay counts tracked
//!
//! ## Trust Model
//!
//! | Rule | Enforcement |
//! |------|-------------|
//! | Checkpoint anchoring | A header at a checkpoint height must carry the checkpoint hash |
//! | Difficulty continuity | Off-boundary headers keep the predecessor's target |
//! | Retarget | Boundary targets are recomputed from the previous interval's timespan |
//! | Proof of work | Header hash must not exceed its expanded target |
//!
//! A peer that serves a header breaking any of these is marked misbehaving,
//! dropped, and replaced; sync resumes from the last validated height.
//!
//! ## Module Structure
//!
//! ```text
//! rito-spv-sync/
//! ├── domain/          # ChainParams, checkpoints, peers, sync state, errors
//! ├── algorithms/      # Compact targets, difficulty rule, header admission
//! ├── ports/           # PeerManagerApi (inbound) + transport/persistence traits (outbound)
//! ├── adapters/        # DNS seed resolver, in-memory header index and persistence
//! ├── application/     # PeerManager worker, relay, listener bus, session registry
//! └── config.rs        # PeerManagerConfig
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use adapters::{DnsSeedResolver, MemoryHeaderIndex, MemoryPersistence, SavedBatch};
pub use algorithms::{
    block_locator, compact_to_target, find_retarget_anchor, proof_of_work_valid, retarget,
    target_to_compact,
};
pub use application::{
    Listener, ListenerBus, PeerManager, PublishCallback, PublishOutcome, RelayUpdate,
    SessionHandle, SessionRegistry, SyncCoordinator, SyncEvent, TransactionRelay,
};
pub use config::PeerManagerConfig;
pub use domain::{
    compute_sync_progress, ChainParams, Checkpoint, CheckpointStore, ConnectStatus,
    ConnectionState, DifficultyRule, Hash, HeaderRecord, Peer, PeerPool, SpvError, SyncState,
    Transaction, ONE_WEEK, RETARGET_INTERVAL, TARGET_TIMESPAN,
};
pub use ports::{
    HeaderIndex, ManagerPorts, PeerChannel, PeerEvent, PeerManagerApi, PeerRequest,
    PeerTransport, PersistenceGateway, SeedResolver, Wallet,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
