//! # Domain Module
//!
//! Core domain types for the SPV peer manager.

pub mod chain_params;
pub mod checkpoints;
pub mod entities;
pub mod errors;
pub mod invariants;
pub mod peer_pool;
pub mod sync_state;
pub mod value_objects;

pub use chain_params::*;
pub use checkpoints::*;
pub use entities::*;
pub use errors::*;
pub use invariants::*;
pub use peer_pool::*;
pub use sync_state::*;
pub use value_objects::*;
