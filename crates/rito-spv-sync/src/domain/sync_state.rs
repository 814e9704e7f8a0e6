//! # Sync State
//!
//! Chain progress as seen by the sync coordinator.

use super::entities::HeaderRecord;
use super::errors::Hash;
use std::net::SocketAddr;

/// Sync state, owned by the coordinator on the worker task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncState {
    /// Height of the last admitted header.
    pub last_validated_height: u32,
    /// Hash of the last admitted header.
    pub last_validated_hash: Hash,
    /// Timestamp of the last admitted header.
    pub last_validated_timestamp: u32,
    /// Best height any peer has claimed.
    pub estimated_network_height: u64,
    /// Peer currently serving headers.
    pub download_peer: Option<SocketAddr>,
}

impl SyncState {
    /// Start from `tip`.
    pub fn new(tip: &HeaderRecord) -> Self {
        Self {
            last_validated_height: tip.height,
            last_validated_hash: tip.hash,
            last_validated_timestamp: tip.timestamp,
            estimated_network_height: u64::from(tip.height),
            download_peer: None,
        }
    }

    /// Move the tip to an admitted header.
    pub fn advance(&mut self, header: &HeaderRecord) {
        self.last_validated_height = header.height;
        self.last_validated_hash = header.hash;
        self.last_validated_timestamp = header.timestamp;
        if u64::from(header.height) > self.estimated_network_height {
            self.estimated_network_height = u64::from(header.height);
        }
    }

    /// Raise the network height estimate. Returns whether it changed.
    pub fn observe_height(&mut self, height: u64) -> bool {
        if height > self.estimated_network_height {
            self.estimated_network_height = height;
            true
        } else {
            false
        }
    }

    /// Reset the estimate; never below the local tip.
    pub fn reset_estimate(&mut self, height: u64) {
        self.estimated_network_height = height.max(u64::from(self.last_validated_height));
    }

    /// Whether the tip has reached the estimated network height.
    pub fn is_synced(&self) -> bool {
        u64::from(self.last_validated_height) >= self.estimated_network_height
    }

    /// Progress fraction relative to `start_height`.
    pub fn progress(&self, start_height: u64) -> f64 {
        compute_sync_progress(
            u64::from(self.last_validated_height),
            self.estimated_network_height,
            start_height,
        )
    }
}

/// Sync progress in `[0, 1]`.
///
/// `1.0` once `last >= estimated`; otherwise the fraction of the
/// `start..estimated` range covered, clamped.
pub fn compute_sync_progress(last: u64, estimated: u64, start: u64) -> f64 {
    if last >= estimated {
        return 1.0;
    }
    let covered = last.saturating_sub(start) as f64;
    let span = estimated.saturating_sub(start).max(1) as f64;
    (covered / span).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_progress_at_tip() {
        assert_eq!(compute_sync_progress(100, 100, 0), 1.0);
        assert_eq!(compute_sync_progress(150, 100, 0), 1.0);
    }

    #[test]
    fn test_progress_halfway() {
        assert_eq!(compute_sync_progress(50, 100, 0), 0.5);
        assert_eq!(compute_sync_progress(75, 100, 50), 0.5);
    }

    #[test]
    fn test_progress_start_above_last() {
        assert_eq!(compute_sync_progress(10, 100, 50), 0.0);
    }

    #[test]
    fn test_progress_start_at_estimate() {
        // Zero-width range: denominator floors at one.
        assert_eq!(compute_sync_progress(99, 100, 100), 0.0);
    }

    #[test]
    fn test_estimate_only_increases() {
        let tip = HeaderRecord::new(10, [1u8; 32], [0u8; 32], 1000, 0x1d00ffff);
        let mut state = SyncState::new(&tip);
        assert!(state.observe_height(500));
        assert!(!state.observe_height(400));
        assert_eq!(state.estimated_network_height, 500);

        state.reset_estimate(0);
        assert_eq!(state.estimated_network_height, 10);
    }

    #[test]
    fn test_advance_moves_tip() {
        let tip = HeaderRecord::new(10, [1u8; 32], [0u8; 32], 1000, 0x1d00ffff);
        let mut state = SyncState::new(&tip);
        state.observe_height(20);
        let next = HeaderRecord::new(11, [2u8; 32], [1u8; 32], 1600, 0x1d00ffff);
        state.advance(&next);
        assert_eq!(state.last_validated_height, 11);
        assert_eq!(state.last_validated_hash, [2u8; 32]);
        assert!(!state.is_synced());
    }

    proptest! {
        #[test]
        fn prop_progress_in_unit_interval(
            last in 0u64..1_000_000,
            estimated in 0u64..1_000_000,
            start in 0u64..1_000_000,
        ) {
            let p = compute_sync_progress(last, estimated, start);
            prop_assert!((0.0..=1.0).contains(&p));
        }

        #[test]
        fn prop_progress_monotone_in_last(
            last in 0u64..1_000_000,
            step in 0u64..10_000,
            estimated in 0u64..1_000_000,
            start in 0u64..1_000_000,
        ) {
            let before = compute_sync_progress(last, estimated, start);
            let after = compute_sync_progress(last + step, estimated, start);
            prop_assert!(after >= before);
        }
    }
}
