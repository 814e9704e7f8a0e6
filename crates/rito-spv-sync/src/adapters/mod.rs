//! # Adapters Layer (Hexagonal Architecture)
//!
//! Implements outbound port traits for the SPV peer manager.

mod dns;
mod memory;

pub use dns::DnsSeedResolver;
pub use memory::{MemoryHeaderIndex, MemoryPersistence, SavedBatch};
