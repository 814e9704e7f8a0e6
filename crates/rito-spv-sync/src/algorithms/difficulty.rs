//! # Difficulty Verifier
//!
//! Pure acceptance predicate for a candidate header's difficulty.
//!
//! # Preconditions
//!
//! At a retarget boundary the verifier needs the header exactly one
//! [`RETARGET_INTERVAL`] below the candidate (the retarget anchor). The
//! caller locates it with [`find_retarget_anchor`]; if it cannot be found
//! the candidate is rejected rather than measured against a zero timestamp.

use super::compact::{proof_of_work_valid, retarget};
use crate::domain::{is_retarget_boundary, DifficultyRule, HeaderRecord, RETARGET_INTERVAL};
use crate::ports::HeaderIndex;

impl DifficultyRule {
    /// Whether `candidate` satisfies this network's difficulty rule.
    ///
    /// `predecessor` is the header `candidate.previous_hash` names and
    /// `anchor` the retarget anchor (only consulted at boundaries).
    pub fn verify(
        &self,
        candidate: &HeaderRecord,
        predecessor: Option<&HeaderRecord>,
        anchor: Option<&HeaderRecord>,
        max_target: u32,
    ) -> bool {
        match self {
            DifficultyRule::AlwaysAccept => true,
            DifficultyRule::StandardRetarget => {
                verify_standard(candidate, predecessor, anchor, max_target)
            }
        }
    }
}

fn verify_standard(
    candidate: &HeaderRecord,
    predecessor: Option<&HeaderRecord>,
    anchor: Option<&HeaderRecord>,
    max_target: u32,
) -> bool {
    let Some(previous) = predecessor else {
        return false;
    };
    if candidate.previous_hash != previous.hash
        || candidate.height != previous.height.wrapping_add(1)
    {
        return false;
    }

    let expected = if is_retarget_boundary(candidate.height) {
        match anchor {
            Some(anchor)
                if anchor.timestamp != 0
                    && anchor.height + RETARGET_INTERVAL == candidate.height =>
            {
                let timespan = i64::from(previous.timestamp) - i64::from(anchor.timestamp);
                retarget(previous.target, timespan, max_target)
            }
            _ => return false,
        }
    } else {
        previous.target
    };

    candidate.target == expected && proof_of_work_valid(&candidate.hash, candidate.target)
}

/// Walk `previous_hash` links back from `candidate` one full interval.
///
/// Returns the header at `candidate.height - RETARGET_INTERVAL`, or `None`
/// if any link in between is missing from the index.
pub fn find_retarget_anchor(
    index: &dyn HeaderIndex,
    candidate: &HeaderRecord,
) -> Option<HeaderRecord> {
    let anchor_height = candidate.height.checked_sub(RETARGET_INTERVAL)?;
    let mut cursor = index.get(&candidate.previous_hash)?;
    while cursor.height > anchor_height {
        cursor = index.get(&cursor.previous_hash)?;
    }
    (cursor.height == anchor_height).then_some(cursor)
}
