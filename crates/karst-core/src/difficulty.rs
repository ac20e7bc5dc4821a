//! Difficulty retargeting schedule.
//!
//! Every [`RETARGET_INTERVAL`] blocks the target is rescaled by the ratio of
//! the actual window duration to [`TARGET_TIMESPAN`], clamped to a factor of
//! four in either direction and never easier than the pow limit. Between
//! boundaries the parent's bits carry forward unchanged.

use primitive_types::U256;

use crate::constants::{RETARGET_INTERVAL, TARGET_TIMESPAN};
use crate::work::{bits_from_target, pow_limit, target_from_bits};

/// Whether the block at `height` starts a new retarget window.
pub fn is_retarget_height(height: u32) -> bool {
    height != 0 && height % RETARGET_INTERVAL == 0
}

/// Height of the first block in the window that closes at `height`.
///
/// Only meaningful when [`is_retarget_height`] holds.
pub fn window_start_height(height: u32) -> u32 {
    height - RETARGET_INTERVAL
}

/// Compute the retargeted bits at a boundary.
///
/// `window_start_time` is the timestamp of the block at
/// [`window_start_height`]; `parent_time` and `parent_bits` come from the
/// boundary block's parent.
pub fn retarget_bits(parent_bits: u32, window_start_time: u32, parent_time: u32) -> u32 {
    let actual = parent_time.saturating_sub(window_start_time);
    let clamped = actual.clamp(TARGET_TIMESPAN / 4, TARGET_TIMESPAN * 4);

    let limit = pow_limit();
    let old_target = target_from_bits(parent_bits).unwrap_or(limit);

    // old_target * clamped / TARGET_TIMESPAN. Multiply-first keeps the
    // on-schedule case exact; a product too large for 256 bits is already
    // past the pow limit.
    let new_target = match old_target.checked_mul(U256::from(clamped)) {
        Some(product) => product / U256::from(TARGET_TIMESPAN),
        None => limit,
    };
    let new_target = new_target.min(limit);

    bits_from_target(new_target)
}

/// Bits the schedule expects for a block at `height`.
///
/// `window_start_time` is only invoked at a boundary, letting callers defer
/// the ancestor walk.
pub fn expected_bits(
    height: u32,
    parent_bits: u32,
    parent_time: u32,
    window_start_time: impl FnOnce() -> u32,
) -> u32 {
    if is_retarget_height(height) {
        retarget_bits(parent_bits, window_start_time(), parent_time)
    } else {
        parent_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::POW_LIMIT_BITS;

    // A mid-range target with headroom in both directions.
    const MID_BITS: u32 = 0x1d00_ffff;

    #[test]
    fn non_boundary_heights_keep_parent_bits() {
        assert_eq!(expected_bits(1, MID_BITS, 0, || unreachable!()), MID_BITS);
        assert_eq!(expected_bits(2_015, MID_BITS, 0, || unreachable!()), MID_BITS);
        assert_eq!(expected_bits(2_017, MID_BITS, 0, || unreachable!()), MID_BITS);
    }

    #[test]
    fn genesis_is_not_a_boundary() {
        assert!(!is_retarget_height(0));
        assert!(is_retarget_height(RETARGET_INTERVAL));
        assert!(is_retarget_height(RETARGET_INTERVAL * 3));
    }

    #[test]
    fn on_schedule_window_keeps_target() {
        let bits = retarget_bits(MID_BITS, 0, TARGET_TIMESPAN);
        assert_eq!(bits, MID_BITS);
    }

    #[test]
    fn fast_window_tightens_target() {
        let bits = retarget_bits(MID_BITS, 0, TARGET_TIMESPAN / 2);
        let new = target_from_bits(bits).unwrap();
        let old = target_from_bits(MID_BITS).unwrap();
        assert!(new < old);
    }

    #[test]
    fn slow_window_relaxes_target() {
        let bits = retarget_bits(MID_BITS, 0, TARGET_TIMESPAN * 2);
        let new = target_from_bits(bits).unwrap();
        let old = target_from_bits(MID_BITS).unwrap();
        assert!(new > old);
    }

    #[test]
    fn adjustment_clamped_to_factor_four() {
        // A one-second window adjusts by exactly 1/4, not more.
        let fast = retarget_bits(MID_BITS, 0, 1);
        let quarter = retarget_bits(MID_BITS, 0, TARGET_TIMESPAN / 4);
        assert_eq!(fast, quarter);

        // A ten-year window adjusts by exactly 4x.
        let slow = retarget_bits(MID_BITS, 0, TARGET_TIMESPAN * 300);
        let quadruple = retarget_bits(MID_BITS, 0, TARGET_TIMESPAN * 4);
        assert_eq!(slow, quadruple);
    }

    #[test]
    fn never_easier_than_pow_limit() {
        let bits = retarget_bits(POW_LIMIT_BITS, 0, TARGET_TIMESPAN * 4);
        assert_eq!(bits, POW_LIMIT_BITS);
    }

    #[test]
    fn window_start_is_one_interval_back() {
        assert_eq!(window_start_height(RETARGET_INTERVAL), 0);
        assert_eq!(window_start_height(RETARGET_INTERVAL * 2), RETARGET_INTERVAL);
    }
}
