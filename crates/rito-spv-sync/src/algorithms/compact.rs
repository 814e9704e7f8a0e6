//! # Compact Targets
//!
//! The 32-bit "compact" encoding of a 256-bit proof-of-work target:
//! one size byte followed by a 23-bit mantissa and a sign bit.
//!
//! ```text
//! target = mantissa * 256^(size - 3)
//! ```

use crate::domain::{Hash, TARGET_TIMESPAN};
use primitive_types::U256;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// Expand a compact target.
///
/// Returns `None` for negative encodings and for ones that overflow 256 bits.
pub fn compact_to_target(compact: u32) -> Option<U256> {
    let size = compact >> 24;
    let mantissa = compact & MANTISSA_MASK;
    if mantissa == 0 {
        return Some(U256::zero());
    }
    if compact & SIGN_BIT != 0 {
        return None;
    }
    if size > 34 || (mantissa > 0xff && size > 33) || (mantissa > 0xffff && size > 32) {
        return None;
    }
    let target = if size <= 3 {
        U256::from(mantissa >> (8 * (3 - size)))
    } else {
        U256::from(mantissa) << (8 * (size - 3) as usize)
    };
    Some(target)
}

/// Encode a target in compact form (lossy: keeps the top three bytes).
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() as u32 + 7) / 8;
    let mut mantissa = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3) as usize)).low_u64() as u32
    };
    if mantissa & SIGN_BIT != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}

/// Next compact target after an interval that took `timespan` seconds.
///
/// The timespan is clamped to a factor of four either way and the result
/// never exceeds `max_target`. Computed on the compact form directly so
/// the result is bit-for-bit what other clients produce.
pub fn retarget(previous_target: u32, timespan: i64, max_target: u32) -> u32 {
    let timespan = timespan.clamp(TARGET_TIMESPAN / 4, TARGET_TIMESPAN * 4) as u64;
    let mut size = i64::from(previous_target >> 24);
    let mantissa = u64::from(previous_target & MANTISSA_MASK);

    // mantissa * 256 * timespan / TARGET_TIMESPAN, one size byte lower
    let mut target = mantissa * timespan / ((TARGET_TIMESPAN as u64) >> 8);
    size -= 1;

    while size < 1 || target > u64::from(MANTISSA_MASK) {
        target >>= 8;
        size += 1;
    }

    let compact = ((size as u32) << 24) | target as u32;
    compact.min(max_target)
}

/// Whether `hash` (big-endian) meets the compact `target`.
pub fn proof_of_work_valid(hash: &Hash, target: u32) -> bool {
    match compact_to_target(target) {
        Some(limit) if !limit.is_zero() => U256::from_big_endian(hash) <= limit,
        _ => false,
    }
}
