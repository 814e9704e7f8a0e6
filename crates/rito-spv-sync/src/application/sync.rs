//! # Sync Coordinator
//!
//! Owns the sync state and the header index, and admits headers from the
//! download peer strictly in height order.
//!
//! ## Admission
//!
//! | Step | Rule | Failure |
//! |------|------|---------|
//! | 1 | `height <= last` is a duplicate, `height > last + 1` is buffered | discarded / held |
//! | 2 | Checkpoint override | `CheckpointMismatch` |
//! | 3 | Parent link to the current tip | `ProtocolViolation` |
//! | 4 | Difficulty rule (anchor looked up at boundaries) | `DifficultyRejected` |
//!
//! Any failure drops the out-of-order buffer, and so does a change of
//! download peer: buffered headers always come from the current one.
//! Headers admitted before a failure stay admitted: each of them passed
//! every rule.

use crate::algorithms::{block_locator, find_retarget_anchor};
use crate::config::PeerManagerConfig;
use crate::domain::{
    is_retarget_boundary, ChainParams, Checkpoint, CheckpointStore, DifficultyRule, Hash,
    HeaderRecord, SpvError, SyncState, ONE_WEEK,
};
use crate::ports::HeaderIndex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Header admission and sync state.
pub struct SyncCoordinator {
    params: Arc<ChainParams>,
    checkpoints: CheckpointStore,
    index: Box<dyn HeaderIndex>,
    state: SyncState,
    /// Headers from the download peer that arrived ahead of the tip, by
    /// height.
    buffered: BTreeMap<u32, HeaderRecord>,
    buffer_limit: usize,
    /// Admitted headers not yet handed to persistence.
    unsaved: Vec<HeaderRecord>,
    save_interval: usize,
    /// Wallet's earliest key time (unix seconds).
    earliest_key_time: f64,
}

impl SyncCoordinator {
    /// Create a coordinator.
    ///
    /// Every checkpoint is seeded into `index`, then `initial_blocks`. The
    /// tip is the highest initial block, or without any the restart
    /// checkpoint for `earliest_key_time`.
    pub fn new(
        params: Arc<ChainParams>,
        config: &PeerManagerConfig,
        mut index: Box<dyn HeaderIndex>,
        initial_blocks: Vec<HeaderRecord>,
        earliest_key_time: f64,
    ) -> Result<Self, SpvError> {
        params.validate()?;
        let checkpoints = CheckpointStore::new(&params);
        seed_checkpoints(index.as_mut(), checkpoints.iter());

        let mut tip: Option<HeaderRecord> = None;
        for block in initial_blocks {
            if tip.as_ref().map_or(true, |t| block.height > t.height) {
                tip = Some(block.clone());
            }
            index.insert(block);
        }

        let tip = match tip {
            Some(tip) => tip,
            None => restart_checkpoint(&params, &checkpoints, earliest_key_time)?
                .to_header(),
        };
        if index.get(&tip.hash).is_none() {
            index.insert(tip.clone());
        }
        info!(network = %params.name, height = tip.height, "sync starts from tip");

        Ok(Self {
            state: SyncState::new(&tip),
            params,
            checkpoints,
            index,
            buffered: BTreeMap::new(),
            buffer_limit: config.header_batch_size.max(1),
            unsaved: Vec::new(),
            save_interval: config.save_blocks_interval.max(1),
            earliest_key_time,
        })
    }

    /// Admit `headers` in height order.
    ///
    /// Returns how many headers were admitted, or the first rule violation.
    pub fn ingest(&mut self, headers: Vec<HeaderRecord>) -> Result<usize, SpvError> {
        let mut admitted = 0;
        for header in headers {
            let next = self.state.last_validated_height.saturating_add(1);
            if header.height < next {
                continue;
            }
            if header.height > next {
                // A re-sent height replaces the earlier copy.
                if self.buffered.len() < self.buffer_limit
                    || self.buffered.contains_key(&header.height)
                {
                    self.buffered.insert(header.height, header);
                } else {
                    debug!(height = header.height, "out-of-order buffer full, discarding");
                }
                continue;
            }

            if let Err(e) = self.admit(header) {
                self.buffered.clear();
                return Err(e);
            }
            admitted += 1;

            while let Some(buffered) = self.take_buffered_next() {
                if let Err(e) = self.admit(buffered) {
                    self.buffered.clear();
                    return Err(e);
                }
                admitted += 1;
            }
        }
        Ok(admitted)
    }

    fn take_buffered_next(&mut self) -> Option<HeaderRecord> {
        let next = self.state.last_validated_height.saturating_add(1);
        // Entries at or below the tip are stale.
        self.buffered = self.buffered.split_off(&next);
        self.buffered.remove(&next)
    }

    fn admit(&mut self, header: HeaderRecord) -> Result<(), SpvError> {
        if !self.checkpoints.is_checkpointed(header.height, &header.hash) {
            warn!(height = header.height, hash = %header.hash_hex(), "checkpoint mismatch");
            return Err(SpvError::CheckpointMismatch {
                height: header.height,
            });
        }

        if header.previous_hash != self.state.last_validated_hash {
            return Err(SpvError::ProtocolViolation(format!(
                "header {} does not extend the tip at {}",
                header.height, self.state.last_validated_height
            )));
        }

        let rule = self.params.difficulty;
        let predecessor = self.index.get(&header.previous_hash);
        let anchor = if rule == DifficultyRule::StandardRetarget
            && is_retarget_boundary(header.height)
        {
            find_retarget_anchor(self.index.as_ref(), &header)
        } else {
            None
        };
        if !rule.verify(
            &header,
            predecessor.as_ref(),
            anchor.as_ref(),
            self.params.max_target,
        ) {
            warn!(height = header.height, target = header.target, "difficulty rejected");
            return Err(SpvError::DifficultyRejected {
                height: header.height,
            });
        }

        self.state.advance(&header);
        self.index.insert(header.clone());
        self.unsaved.push(header);
        Ok(())
    }

    /// Admitted headers due for `save_blocks(false, ..)`: a full interval,
    /// or whatever is pending when `force` is set.
    pub fn take_due_saves(&mut self, force: bool) -> Option<Vec<HeaderRecord>> {
        let due = self.unsaved.len() >= self.save_interval || (force && !self.unsaved.is_empty());
        due.then(|| std::mem::take(&mut self.unsaved))
    }

    /// Roll back to the restart checkpoint for the wallet's earliest key
    /// time (never above the current tip).
    ///
    /// Returns the headers kept, for `save_blocks(true, ..)`.
    pub fn rescan(&mut self, estimated_height: u64) -> Result<Vec<HeaderRecord>, SpvError> {
        let checkpoint =
            restart_checkpoint(&self.params, &self.checkpoints, self.earliest_key_time)?.clone();

        let tip = if checkpoint.height < self.state.last_validated_height {
            self.index
                .get(&checkpoint.hash)
                .unwrap_or_else(|| checkpoint.to_header())
        } else {
            self.tip()
        };

        let removed = self.index.remove_above(tip.height);
        if self.index.get(&tip.hash).is_none() {
            self.index.insert(tip.clone());
        }
        let retained = self.index.headers_from(0);
        let floor = tip.height;
        seed_checkpoints(
            self.index.as_mut(),
            self.checkpoints.iter().filter(|cp| cp.height > floor),
        );

        self.state = SyncState::new(&tip);
        self.state.reset_estimate(estimated_height);
        self.buffered.clear();
        self.unsaved.clear();
        info!(height = tip.height, removed, "rescan rolled back chain");
        Ok(retained)
    }

    /// Raise the network height estimate.
    pub fn observe_height(&mut self, height: u64) -> bool {
        self.state.observe_height(height)
    }

    /// Current sync state.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Record the download peer. A different peer invalidates whatever the
    /// previous one left in the out-of-order buffer.
    pub fn set_download_peer(&mut self, peer: Option<std::net::SocketAddr>) {
        if self.state.download_peer != peer && !self.buffered.is_empty() {
            debug!(
                discarded = self.buffered.len(),
                "download peer changed, dropping buffered headers"
            );
            self.buffered.clear();
        }
        self.state.download_peer = peer;
    }

    /// Lower (or raise) the network height estimate, never below the tip.
    pub fn reset_estimate(&mut self, height: u64) {
        self.state.reset_estimate(height);
    }

    /// Whether the tip has reached the network estimate.
    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    /// Header at the tip.
    pub fn tip(&self) -> HeaderRecord {
        self.index
            .get(&self.state.last_validated_hash)
            .unwrap_or_else(|| {
                HeaderRecord::new(
                    self.state.last_validated_height,
                    self.state.last_validated_hash,
                    [0u8; 32],
                    self.state.last_validated_timestamp,
                    0,
                )
            })
    }

    /// Locator for the next `GetHeaders` request.
    pub fn locator(&self) -> Vec<Hash> {
        block_locator(self.index.as_ref(), &self.tip())
    }

    /// Number of headers held ahead of the tip.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// The header store.
    pub fn index(&self) -> &dyn HeaderIndex {
        self.index.as_ref()
    }
}

fn seed_checkpoints<'a>(
    index: &mut dyn HeaderIndex,
    checkpoints: impl Iterator<Item = &'a Checkpoint>,
) {
    for cp in checkpoints {
        if index.get(&cp.hash).is_none() {
            index.insert(cp.to_header());
        }
    }
}

/// Restart checkpoint for a wallet whose keys date from `earliest_key_time`.
fn restart_checkpoint<'a>(
    params: &ChainParams,
    checkpoints: &'a CheckpointStore,
    earliest_key_time: f64,
) -> Result<&'a Checkpoint, SpvError> {
    let key_time = if earliest_key_time.is_finite() && earliest_key_time > 0.0 {
        earliest_key_time as u64
    } else {
        0
    };
    let aligned_only = params.difficulty == DifficultyRule::StandardRetarget;
    checkpoints
        .restart_point(key_time.saturating_sub(ONE_WEEK), aligned_only)
        .ok_or_else(|| {
            SpvError::InvalidChainParams(format!("network {} has no checkpoints", params.name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryHeaderIndex;
    use crate::domain::{hash_from_hex, RETARGET_INTERVAL, TARGET_TIMESPAN};
    use crate::testing::{build_chain, chain_hash, test_params};

    const LIMIT: u32 = 0x1e00ffff;

    fn coordinator(params: ChainParams, blocks: Vec<HeaderRecord>) -> SyncCoordinator {
        SyncCoordinator::new(
            Arc::new(params),
            &PeerManagerConfig::for_testing(),
            Box::new(MemoryHeaderIndex::new()),
            blocks,
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn test_starts_from_genesis_checkpoint() {
        let sync = coordinator(test_params(), vec![]);
        assert_eq!(sync.state().last_validated_height, 0);
        assert_eq!(sync.state().last_validated_hash, chain_hash(0));
    }

    #[test]
    fn test_restart_point_from_key_time() {
        let mut params = test_params();
        params.checkpoints.push(Checkpoint::new(2016, chain_hash(2016), 2_000_000, LIMIT));
        let sync = SyncCoordinator::new(
            Arc::new(params),
            &PeerManagerConfig::for_testing(),
            Box::new(MemoryHeaderIndex::new()),
            vec![],
            (2_000_000 + ONE_WEEK) as f64,
        )
        .unwrap();
        assert_eq!(sync.state().last_validated_height, 2016);
    }

    #[test]
    fn test_mainnet_restart_skips_misaligned_checkpoint() {
        let sync = coordinator(ChainParams::mainnet(), vec![]);
        assert_eq!(sync.state().last_validated_height, 0);

        let late = SyncCoordinator::new(
            Arc::new(ChainParams::mainnet()),
            &PeerManagerConfig::for_testing(),
            Box::new(MemoryHeaderIndex::new()),
            vec![],
            1_700_000_000.0,
        )
        .unwrap();
        assert_eq!(late.state().last_validated_height, 0);
    }

    #[test]
    fn test_initial_blocks_set_tip() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let sync = coordinator(test_params(), chain.clone());
        assert_eq!(sync.state().last_validated_height, 9);
        assert_eq!(sync.tip(), chain[9]);
    }

    #[test]
    fn test_ingest_in_order() {
        let chain = build_chain(0, 30, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        assert_eq!(sync.ingest(chain[1..].to_vec()).unwrap(), 29);
        assert_eq!(sync.state().last_validated_height, 29);
        assert_eq!(sync.index().len(), 30);
    }

    #[test]
    fn test_ingest_skips_duplicates() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        sync.ingest(chain[1..6].to_vec()).unwrap();
        assert_eq!(sync.ingest(chain[3..10].to_vec()).unwrap(), 4);
        assert_eq!(sync.state().last_validated_height, 9);
    }

    #[test]
    fn test_ingest_buffers_out_of_order() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        let mut shuffled = chain[1..10].to_vec();
        shuffled.reverse();

        // Only height 1 is admissible in the first pass; the rest drain.
        assert_eq!(sync.ingest(shuffled).unwrap(), 9);
        assert_eq!(sync.state().last_validated_height, 9);
        assert_eq!(sync.buffered_len(), 0);
    }

    #[test]
    fn test_ingest_holds_gap() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        assert_eq!(sync.ingest(chain[5..10].to_vec()).unwrap(), 0);
        assert_eq!(sync.buffered_len(), 5);
        assert_eq!(sync.ingest(chain[1..5].to_vec()).unwrap(), 9);
    }

    #[test]
    fn test_download_peer_change_drops_buffer() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        let first = "10.0.0.1:7342".parse().unwrap();
        let second = "10.0.0.2:7342".parse().unwrap();
        sync.set_download_peer(Some(first));

        // Gapped batch from a fork the first peer was serving.
        let mut forked = chain[6..10].to_vec();
        for header in &mut forked {
            header.hash[0] = 0xee;
            header.previous_hash[0] = 0xee;
        }
        assert_eq!(sync.ingest(forked).unwrap(), 0);
        assert_eq!(sync.buffered_len(), 4);

        sync.set_download_peer(Some(first));
        assert_eq!(sync.buffered_len(), 4);
        sync.set_download_peer(None);
        assert_eq!(sync.buffered_len(), 0);

        sync.set_download_peer(Some(second));
        assert_eq!(sync.ingest(chain[1..10].to_vec()).unwrap(), 9);
        assert_eq!(sync.state().last_validated_hash, chain_hash(9));
    }

    #[test]
    fn test_resent_height_replaces_buffered_header() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        let mut stale = chain[5].clone();
        stale.previous_hash = [7u8; 32];
        assert_eq!(sync.ingest(vec![stale]).unwrap(), 0);

        assert_eq!(sync.ingest(chain[5..10].to_vec()).unwrap(), 0);
        assert_eq!(sync.buffered_len(), 5);
        assert_eq!(sync.ingest(chain[1..5].to_vec()).unwrap(), 9);
    }

    #[test]
    fn test_reset_estimate_not_below_tip() {
        let chain = build_chain(0, 10, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        sync.observe_height(100);
        sync.ingest(chain[1..10].to_vec()).unwrap();
        assert!(!sync.is_synced());

        sync.reset_estimate(4);
        assert_eq!(sync.state().estimated_network_height, 9);
        assert!(sync.is_synced());
    }

    #[test]
    fn test_broken_link_rejected() {
        let chain = build_chain(0, 5, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        let mut bad = chain[1].clone();
        bad.previous_hash = [7u8; 32];
        let err = sync.ingest(vec![bad]).unwrap_err();
        assert!(matches!(err, SpvError::ProtocolViolation(_)));
        assert_eq!(sync.state().last_validated_height, 0);
    }

    #[test]
    fn test_target_change_off_boundary_rejected() {
        let chain = build_chain(0, 5, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        let mut headers = chain[1..].to_vec();
        headers[2].target = 0x1d00ffff;
        headers[2].hash = [0u8; 32];
        headers[2].hash[31] = 0x33;
        headers[3].previous_hash = headers[2].hash;

        let err = sync.ingest(headers).unwrap_err();
        assert!(matches!(err, SpvError::DifficultyRejected { height: 3 }));
        assert_eq!(sync.state().last_validated_height, 2);
        assert_eq!(sync.buffered_len(), 0);
    }

    #[test]
    fn test_checkpoint_overrides_proof_of_work() {
        let mut params = test_params();
        params.checkpoints.push(Checkpoint::new(5, [0xcc; 32], 0, LIMIT));
        let chain = build_chain(0, 6, 1_000_000, LIMIT);
        let mut sync = coordinator(params, vec![]);

        let err = sync.ingest(chain[1..].to_vec()).unwrap_err();
        assert!(matches!(err, SpvError::CheckpointMismatch { height: 5 }));
        assert_eq!(sync.state().last_validated_height, 4);
    }

    #[test]
    fn test_mainnet_checkpoint_13205_mismatch() {
        let params = ChainParams::mainnet();
        let checkpoint = params.checkpoints[1].clone();
        let predecessor = HeaderRecord::new(13204, [0x11; 32], [0x10; 32], 1_544_304_000, 0x1b2f6c70);
        let mut sync = coordinator(params, vec![predecessor.clone()]);

        // Valid work against the target, wrong hash.
        let mut forged = HeaderRecord::new(13205, [0u8; 32], predecessor.hash, 1_544_304_635, 0x1b2f6c70);
        forged.hash[31] = 1;
        let err = sync.ingest(vec![forged]).unwrap_err();
        assert!(matches!(err, SpvError::CheckpointMismatch { height: 13205 }));

        let genuine = HeaderRecord::new(13205, checkpoint.hash, predecessor.hash, 1_544_304_635, 0x1b2f6c70);
        assert_eq!(sync.ingest(vec![genuine]).unwrap(), 1);
        assert_eq!(
            sync.state().last_validated_hash,
            hash_from_hex("00000000002d64255013feb75a702864edc57ca4a7dd307dc3c5c41f817f40a4")
        );
    }

    #[test]
    fn test_retarget_boundary_uses_anchor() {
        // One interval at exactly the target timespan keeps the target.
        let spacing = (TARGET_TIMESPAN / i64::from(RETARGET_INTERVAL - 1)) as u32;
        let mut chain = build_chain(0, RETARGET_INTERVAL as usize, 1_000_000, LIMIT);
        for (i, header) in chain.iter_mut().enumerate() {
            header.timestamp = 1_000_000 + spacing * i as u32;
        }
        let mut sync = coordinator(test_params(), chain.clone());
        let previous = &chain[RETARGET_INTERVAL as usize - 1];
        let elapsed = i64::from(previous.timestamp) - 1_000_000;
        let expected = crate::algorithms::retarget(LIMIT, elapsed, LIMIT);

        let boundary = HeaderRecord::new(
            RETARGET_INTERVAL,
            chain_hash(RETARGET_INTERVAL),
            previous.hash,
            previous.timestamp + spacing,
            expected,
        );
        assert_eq!(sync.ingest(vec![boundary.clone()]).unwrap(), 1);

        let mut wrong = boundary;
        wrong.height += 1;
        wrong.previous_hash = sync.state().last_validated_hash;
        wrong.hash = chain_hash(RETARGET_INTERVAL + 1);
        wrong.target = expected - 1;
        assert!(sync.ingest(vec![wrong]).is_err());
    }

    #[test]
    fn test_periodic_saves() {
        let chain = build_chain(0, 50, 1_000_000, LIMIT);
        let mut sync = coordinator(test_params(), vec![]);
        sync.ingest(chain[1..16].to_vec()).unwrap();
        assert!(sync.take_due_saves(false).is_none());

        sync.ingest(chain[16..25].to_vec()).unwrap();
        assert_eq!(sync.take_due_saves(false).map(|b| b.len()), Some(24));
        assert!(sync.take_due_saves(true).is_none());

        sync.ingest(chain[25..30].to_vec()).unwrap();
        assert_eq!(sync.take_due_saves(true).map(|b| b.len()), Some(5));
    }

    #[test]
    fn test_rescan_rolls_back_to_checkpoint() {
        let mut params = test_params();
        params.checkpoints.push(Checkpoint::new(40, chain_hash(40), 1_000_000 + 40 * 600, LIMIT));
        let chain = build_chain(0, 60, 1_000_000, LIMIT);
        let mut sync = coordinator(params, vec![]);
        sync.observe_height(59);
        sync.ingest(chain[1..60].to_vec()).unwrap();
        assert_eq!(sync.state().last_validated_height, 59);

        let retained = sync.rescan(59).unwrap();
        assert_eq!(sync.state().last_validated_height, 0);
        assert_eq!(retained.len(), 1);
        // Checkpoint above the restart point is still known.
        assert!(sync.index().get(&chain_hash(40)).is_some());
        assert_eq!(sync.state().estimated_network_height, 59);
        assert!(sync.take_due_saves(true).is_none());

        assert_eq!(sync.ingest(chain[1..60].to_vec()).unwrap(), 59);
    }
}
