//! # Domain Invariants
//!
//! Consensus constants and the structural rules chain parameters must obey.

use super::errors::SpvError;
use super::value_objects::Checkpoint;

/// Blocks between difficulty retargets.
pub const RETARGET_INTERVAL: u32 = 2016;

/// Intended duration of one retarget interval (14 days, in seconds).
pub const TARGET_TIMESPAN: i64 = 14 * 24 * 60 * 60;

/// Slack subtracted from the wallet's earliest key time when choosing a
/// restart checkpoint.
pub const ONE_WEEK: u64 = 7 * 24 * 60 * 60;

/// Whether `height` is a difficulty retarget boundary.
pub fn is_retarget_boundary(height: u32) -> bool {
    height % RETARGET_INTERVAL == 0
}

/// Invariant: checkpoint heights strictly increase.
pub fn invariant_checkpoints_ordered(checkpoints: &[Checkpoint]) -> Result<(), SpvError> {
    for pair in checkpoints.windows(2) {
        if pair[1].height <= pair[0].height {
            return Err(SpvError::InvalidChainParams(format!(
                "checkpoint heights must strictly increase: {} then {}",
                pair[0].height, pair[1].height
            )));
        }
    }
    Ok(())
}

/// Checkpoints that do not sit on a retarget boundary.
///
/// Such a checkpoint cannot serve as the retarget anchor for the following
/// boundary, so a sync restarted from it needs earlier headers.
pub fn misaligned_checkpoints(checkpoints: &[Checkpoint]) -> Vec<u32> {
    checkpoints
        .iter()
        .filter(|cp| !is_retarget_boundary(cp.height))
        .map(|cp| cp.height)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(height: u32) -> Checkpoint {
        Checkpoint::new(height, [height as u8; 32], 0, 0x1d00ffff)
    }

    #[test]
    fn test_retarget_boundary() {
        assert!(is_retarget_boundary(0));
        assert!(is_retarget_boundary(2016));
        assert!(is_retarget_boundary(4032));
        assert!(!is_retarget_boundary(2015));
        assert!(!is_retarget_boundary(13205));
    }

    #[test]
    fn test_checkpoints_ordered_pass() {
        assert!(invariant_checkpoints_ordered(&[cp(0), cp(2016), cp(4032)]).is_ok());
        assert!(invariant_checkpoints_ordered(&[]).is_ok());
    }

    #[test]
    fn test_checkpoints_ordered_fail() {
        assert!(invariant_checkpoints_ordered(&[cp(2016), cp(2016)]).is_err());
        assert!(invariant_checkpoints_ordered(&[cp(4032), cp(2016)]).is_err());
    }

    #[test]
    fn test_misaligned_checkpoints() {
        assert_eq!(misaligned_checkpoints(&[cp(0), cp(13205), cp(4032)]), vec![13205]);
    }

    #[test]
    fn test_target_timespan_is_multiple_of_256() {
        assert_eq!(TARGET_TIMESPAN % 256, 0);
    }
}
