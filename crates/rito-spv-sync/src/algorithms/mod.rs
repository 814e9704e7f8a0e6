//! # Algorithms Module
//!
//! Consensus arithmetic and header screening for SPV sync.

pub mod compact;
pub mod difficulty;
pub mod header_sync;

pub use compact::{compact_to_target, proof_of_work_valid, retarget, target_to_compact};
pub use difficulty::find_retarget_anchor;
pub use header_sync::block_locator;
