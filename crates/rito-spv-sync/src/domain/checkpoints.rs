//! # Checkpoint Store
//!
//! Height-ordered lookup over a network's checkpoints. A header at a
//! checkpoint height is only admissible with the checkpoint hash, regardless
//! of its proof of work.

use super::chain_params::ChainParams;
use super::errors::Hash;
use super::invariants::is_retarget_boundary;
use super::value_objects::Checkpoint;

/// Read-only checkpoint lookup.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    /// Checkpoints, ascending by height.
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointStore {
    /// Build the store from chain parameters.
    pub fn new(params: &ChainParams) -> Self {
        Self::from_checkpoints(params.checkpoints.clone())
    }

    /// Build the store from a checkpoint list (sorted defensively by height).
    pub fn from_checkpoints(mut checkpoints: Vec<Checkpoint>) -> Self {
        checkpoints.sort_by_key(|cp| cp.height);
        Self { checkpoints }
    }

    /// Checkpoint exactly at `height`.
    pub fn get(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |cp| cp.height)
            .ok()
            .map(|i| &self.checkpoints[i])
    }

    /// Highest checkpoint with `checkpoint.height <= height`.
    pub fn nearest_at_or_below(&self, height: u32) -> Option<&Checkpoint> {
        let idx = self.checkpoints.partition_point(|cp| cp.height <= height);
        idx.checked_sub(1).map(|i| &self.checkpoints[i])
    }

    /// `false` only when `height` is checkpointed and `hash` disagrees.
    pub fn is_checkpointed(&self, height: u32, hash: &Hash) -> bool {
        self.get(height).map_or(true, |cp| cp.hash == *hash)
    }

    /// Restart point for a wallet whose relevant history begins at
    /// `timestamp`: the last checkpoint not after it, or the first checkpoint.
    pub fn last_before_timestamp(&self, timestamp: u64) -> Option<&Checkpoint> {
        self.restart_point(timestamp, false)
    }

    /// Checkpoint to restart header download from for a wallet whose
    /// history begins at `timestamp`.
    ///
    /// With `aligned_only`, checkpoints off a retarget boundary are skipped:
    /// a sync started there could not verify the next retarget.
    pub fn restart_point(&self, timestamp: u64, aligned_only: bool) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .filter(|cp| !aligned_only || is_retarget_boundary(cp.height))
            .find(|cp| u64::from(cp.timestamp) <= timestamp)
            .or_else(|| self.checkpoints.first())
    }

    /// Highest checkpoint.
    pub fn last(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// All checkpoints, ascending.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    /// Number of checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether there are no checkpoints.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CheckpointStore {
        CheckpointStore::from_checkpoints(vec![
            Checkpoint::new(4032, [3u8; 32], 3000, 0x1d00ffff),
            Checkpoint::new(0, [1u8; 32], 1000, 0x1d00ffff),
            Checkpoint::new(2016, [2u8; 32], 2000, 0x1d00ffff),
        ])
    }

    #[test]
    fn test_nearest_at_or_below() {
        let store = store();
        assert_eq!(store.nearest_at_or_below(0).unwrap().height, 0);
        assert_eq!(store.nearest_at_or_below(2015).unwrap().height, 0);
        assert_eq!(store.nearest_at_or_below(2016).unwrap().height, 2016);
        assert_eq!(store.nearest_at_or_below(100_000).unwrap().height, 4032);
    }

    #[test]
    fn test_nearest_below_first_is_none() {
        let store = CheckpointStore::from_checkpoints(vec![Checkpoint::new(
            100, [1u8; 32], 0, 0,
        )]);
        assert!(store.nearest_at_or_below(99).is_none());
    }

    #[test]
    fn test_is_checkpointed() {
        let store = store();
        assert!(store.is_checkpointed(2016, &[2u8; 32]));
        assert!(!store.is_checkpointed(2016, &[9u8; 32]));
        // Not a checkpoint height: nothing to contradict.
        assert!(store.is_checkpointed(2017, &[9u8; 32]));
    }

    #[test]
    fn test_last_before_timestamp() {
        let store = store();
        assert_eq!(store.last_before_timestamp(2500).unwrap().height, 2016);
        assert_eq!(store.last_before_timestamp(3000).unwrap().height, 4032);
        // Before every checkpoint: fall back to the first.
        assert_eq!(store.last_before_timestamp(10).unwrap().height, 0);
    }

    #[test]
    fn test_restart_point_skips_misaligned() {
        let store = CheckpointStore::new(&ChainParams::mainnet());
        let later = 1_600_000_000;
        assert_eq!(store.restart_point(later, false).unwrap().height, 13205);
        assert_eq!(store.restart_point(later, true).unwrap().height, 0);
    }

    #[test]
    fn test_mainnet_store() {
        let store = CheckpointStore::new(&ChainParams::mainnet());
        assert_eq!(store.len(), 2);
        assert_eq!(store.last().unwrap().height, 13205);
        assert_eq!(store.nearest_at_or_below(13204).unwrap().height, 0);
    }
}
