//! # Domain Errors
//!
//! Error types for the SPV peer manager.
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Config | `InvalidPeerAddress`, `InvalidChainParams` | returned, non-fatal |
//! | Protocol violation | `CheckpointMismatch`, `DifficultyRejected`, `ProtocolViolation` | peer demoted, sync continues |
//! | Connectivity | `Connectivity`, `NoPeersConnected`, `Transport` | retried with backoff |
//! | Publish | `PublishTimeout`, `PublishCancelled`, `InvalidTransaction` | reported to the publish callback |
//! | Lifecycle | `Lifecycle` | fatal to the call |

use thiserror::Error;

/// Hash type alias (32 bytes, big-endian display order)
pub type Hash = [u8; 32];

/// SPV peer manager error types.
#[derive(Debug, Error)]
pub enum SpvError {
    /// Fixed peer host could not be parsed as an address.
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),

    /// Chain parameters violate a structural invariant.
    #[error("Invalid chain parameters: {0}")]
    InvalidChainParams(String),

    /// Header at a checkpoint height does not carry the checkpoint hash.
    #[error("Checkpoint mismatch at height {height}")]
    CheckpointMismatch {
        /// Block height where mismatch occurred
        height: u32,
    },

    /// Header failed the difficulty rule or its proof of work.
    #[error("Difficulty check failed at height {height}")]
    DifficultyRejected {
        /// Block height of the rejected header
        height: u32,
    },

    /// Peer sent data that breaks the protocol (broken parent link, malformed message).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// No peer could be reached or seed resolution failed.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Operation needs at least one connected peer.
    #[error("No peers connected")]
    NoPeersConnected,

    /// Transport-level failure on a single peer link.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Published transaction was not relayed in time.
    #[error("Transaction {0} was not relayed before the timeout")]
    PublishTimeout(String),

    /// Published transaction was abandoned by a disconnect.
    #[error("Publish of transaction {0} cancelled by disconnect")]
    PublishCancelled(String),

    /// Transaction refused before broadcast.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Operation invoked on a disposed or unknown session.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl SpvError {
    /// Whether the error is a peer protocol violation that demotes the peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::CheckpointMismatch { .. }
                | Self::DifficultyRejected { .. }
                | Self::ProtocolViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_mismatch_error() {
        let err = SpvError::CheckpointMismatch { height: 13205 };
        assert!(err.to_string().contains("13205"));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_difficulty_rejected_error() {
        let err = SpvError::DifficultyRejected { height: 4032 };
        assert!(err.to_string().contains("4032"));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_connectivity_is_not_violation() {
        let err = SpvError::Connectivity("dns failed".to_string());
        assert!(!err.is_protocol_violation());
        assert!(err.to_string().contains("dns failed"));
    }

    #[test]
    fn test_lifecycle_error() {
        let err = SpvError::Lifecycle("session disposed".to_string());
        assert!(err.to_string().contains("disposed"));
    }
}
