//! # Peer Manager Configuration
//!
//! Tunables for connection management, header sync and transaction relay.
//! Consensus rules live in [`ChainParams`](crate::domain::ChainParams), not here.

use serde::{Deserialize, Serialize};

/// Peer manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerManagerConfig {
    /// Number of peers to keep connected concurrently.
    pub max_connect_count: usize,

    /// Maximum headers requested per batch (also bounds the out-of-order buffer).
    pub header_batch_size: usize,

    /// Admitted headers accumulated before `save_blocks` is invoked.
    pub save_blocks_interval: usize,

    /// Give up on a dial, and separately on the handshake after it, after
    /// this many milliseconds.
    pub connect_timeout_ms: u64,

    /// Time a published transaction has to reach `min_relay_count`.
    pub publish_timeout_ms: u64,

    /// Distinct relaying peers required before a publish counts as delivered.
    pub min_relay_count: u64,

    /// First reconnect delay after a connectivity failure.
    pub reconnect_backoff_base_ms: u64,

    /// Upper bound for the doubling reconnect delay.
    pub reconnect_backoff_max_ms: u64,

    /// How long a misbehaving peer is excluded from selection.
    pub misbehavior_ban_secs: u64,

    /// Number of published transactions whose relay counts are remembered.
    pub relay_cache_size: usize,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            max_connect_count: 3,
            header_batch_size: 2000,
            save_blocks_interval: 500,
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 10_000,
            min_relay_count: 1,
            reconnect_backoff_base_ms: 1_000,
            reconnect_backoff_max_ms: 60_000,
            misbehavior_ban_secs: 3_600,
            relay_cache_size: 1_000,
        }
    }
}

impl PeerManagerConfig {
    /// Create a config for testing (smaller values).
    pub fn for_testing() -> Self {
        Self {
            max_connect_count: 3,
            header_batch_size: 50,
            save_blocks_interval: 20,
            connect_timeout_ms: 500,
            publish_timeout_ms: 500,
            min_relay_count: 1,
            reconnect_backoff_base_ms: 50,
            reconnect_backoff_max_ms: 400,
            misbehavior_ban_secs: 60,
            relay_cache_size: 16,
        }
    }

    /// Reconnect delay for the given consecutive failure count.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        self.reconnect_backoff_base_ms
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PeerManagerConfig::default();
        assert_eq!(config.max_connect_count, 3);
        assert_eq!(config.header_batch_size, 2000);
        assert_eq!(config.min_relay_count, 1);
    }

    #[test]
    fn test_testing_config() {
        let config = PeerManagerConfig::for_testing();
        assert!(config.publish_timeout_ms < 1_000);
        assert!(config.save_blocks_interval < config.header_batch_size);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PeerManagerConfig::for_testing();
        assert_eq!(config.backoff_ms(0), 50);
        assert_eq!(config.backoff_ms(1), 100);
        assert_eq!(config.backoff_ms(2), 200);
        assert_eq!(config.backoff_ms(3), 400);
        assert_eq!(config.backoff_ms(10), 400);
        assert_eq!(config.backoff_ms(u32::MAX), 400);
    }
}
