//! Difficulty adjustment algorithm.
//!
//! Retargets the proof-of-work difficulty every
//! [`ADJUSTMENT_INTERVAL`](crate::constants::ADJUSTMENT_INTERVAL) blocks,
//! comparing the actual elapsed time over the window against the expected
//! time and adjusting the target proportionally. Per-window adjustments are
//! clamped to [`MAX_ADJUSTMENT_FACTOR`] (4×) to prevent wild swings from
//! timestamp manipulation or sudden hashrate changes.
//!
//! # Target semantics
//!
//! The `target` field in [`BlockHeader`](crate::types::BlockHeader) is a
//! [`Uint256`] where **lower = harder**, matching Bitcoin's convention. A
//! header is valid proof of work when its double-SHA-256 hash, interpreted
//! as a big-endian 256-bit integer, is strictly less than the target.
//!
//! # Window sizing
//!
//! Blocks between retarget boundaries (`height % ADJUSTMENT_INTERVAL != 0`)
//! inherit the parent's target unchanged. At a boundary, the window spans
//! the `ADJUSTMENT_INTERVAL + 1` timestamps immediately preceding the new
//! block, giving exactly `ADJUSTMENT_INTERVAL` intervals.

use crate::constants::{ADJUSTMENT_INTERVAL, TARGET_BLOCK_TIME_MS};
use crate::uint256::Uint256;

/// Maximum difficulty adjustment factor per window.
///
/// The target cannot change by more than this factor in a single adjustment.
/// Prevents extreme swings from timestamp manipulation or hashrate spikes.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Minimum difficulty target (hardest possible difficulty).
pub const MIN_TARGET: Uint256 = Uint256::ONE;

/// Maximum (easiest) difficulty target. Used for the genesis block.
pub const MAX_TARGET: Uint256 = Uint256::MAX;

/// Compute the next difficulty target from a window of recent timestamps.
///
/// `timestamps_ms` must be ordered oldest to newest. `current_target` is the
/// difficulty target of the most recent block in the window.
///
/// Returns `current_target` unchanged if fewer than 2 timestamps are
/// provided (not enough data for adjustment). Otherwise computes:
///
/// 1. `actual_time = timestamps.last() - timestamps.first()`
/// 2. `expected_time = (timestamps.len() - 1) * TARGET_BLOCK_TIME_MS`
/// 3. Clamp actual time to `[expected / 4, expected * 4]`
/// 4. `new_target = current_target * clamped_actual / expected`
/// 5. Clamp result to `[MIN_TARGET, MAX_TARGET]`
pub fn next_target(timestamps_ms: &[u64], current_target: Uint256) -> Uint256 {
    if timestamps_ms.len() < 2 {
        return current_target;
    }

    let actual_time = timestamps_ms[timestamps_ms.len() - 1].saturating_sub(timestamps_ms[0]);
    let intervals = (timestamps_ms.len() - 1) as u64;
    let expected_time = intervals * TARGET_BLOCK_TIME_MS;

    if expected_time == 0 {
        return current_target;
    }

    let min_time = expected_time / MAX_ADJUSTMENT_FACTOR;
    let max_time = expected_time.saturating_mul(MAX_ADJUSTMENT_FACTOR);
    let clamped = actual_time.max(min_time).min(max_time);

    let scaled = current_target.saturating_mul_u64(clamped);
    let result = scaled.div_u64(expected_time);

    result.clamp(MIN_TARGET, MAX_TARGET)
}

/// Compute the target for the block at `height`.
///
/// `parent_target` is the target of the block at `height - 1`. `get_timestamp_ms`
/// returns the timestamp (in milliseconds) of the block at a given height and
/// must be valid for all heights in the selected window.
///
/// Blocks that do not land on a retarget boundary (`height % ADJUSTMENT_INTERVAL
/// != 0`, including the entire first window) inherit `parent_target` unchanged.
pub fn target_for_height(
    height: u64,
    parent_target: Uint256,
    get_timestamp_ms: impl Fn(u64) -> u64,
) -> Uint256 {
    if height <= ADJUSTMENT_INTERVAL || height % ADJUSTMENT_INTERVAL != 0 {
        return parent_target;
    }

    let start = height - ADJUSTMENT_INTERVAL - 1;
    let timestamps: Vec<u64> = (start..height).map(&get_timestamp_ms).collect();

    next_target(&timestamps, parent_target)
}

/// Expected total time for a full difficulty window (in milliseconds).
///
/// Equals `ADJUSTMENT_INTERVAL * TARGET_BLOCK_TIME_MS`.
pub const fn expected_window_time_ms() -> u64 {
    ADJUSTMENT_INTERVAL * TARGET_BLOCK_TIME_MS
}

/// The number of timestamp entries used in a full difficulty window.
///
/// Equals `ADJUSTMENT_INTERVAL + 1` (one more than the number of intervals).
pub const fn full_window_size() -> u64 {
    ADJUSTMENT_INTERVAL + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Generate `count` timestamps starting at `start`, spaced by `interval` ms.
    fn spaced_timestamps(start: u64, count: usize, interval: u64) -> Vec<u64> {
        (0..count).map(|i| start + i as u64 * interval).collect()
    }

    fn target(n: u64) -> Uint256 {
        Uint256::from_u64(n)
    }

    // ------------------------------------------------------------------
    // next_target — edge cases
    // ------------------------------------------------------------------

    #[test]
    fn next_target_empty_returns_current() {
        assert_eq!(next_target(&[], target(1000)), target(1000));
    }

    #[test]
    fn next_target_single_returns_current() {
        assert_eq!(next_target(&[100], target(1000)), target(1000));
    }

    // ------------------------------------------------------------------
    // next_target — on-target timing
    // ------------------------------------------------------------------

    #[test]
    fn on_target_returns_same_difficulty() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS);
        let t = target(1_000_000);
        assert_eq!(next_target(&ts, t), t);
    }

    #[test]
    fn on_target_small_window() {
        let ts = vec![100, 100 + TARGET_BLOCK_TIME_MS];
        let t = target(500_000);
        assert_eq!(next_target(&ts, t), t);
    }

    // ------------------------------------------------------------------
    // next_target — slow blocks → easier (higher target)
    // ------------------------------------------------------------------

    #[test]
    fn slow_blocks_increase_target() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS * 2);
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(2_000_000));
    }

    #[test]
    fn slow_blocks_three_times() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS * 3);
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(3_000_000));
    }

    // ------------------------------------------------------------------
    // next_target — fast blocks → harder (lower target)
    // ------------------------------------------------------------------

    #[test]
    fn fast_blocks_decrease_target() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS / 2);
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(500_000));
    }

    #[test]
    fn fast_blocks_three_times() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS / 3);
        let t = target(1_200_000); // divisible by 3
        let new = next_target(&ts, t);
        assert_eq!(new, target(400_000));
    }

    // ------------------------------------------------------------------
    // next_target — clamping
    // ------------------------------------------------------------------

    #[test]
    fn clamps_max_increase_to_4x() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS * 10);
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(1_000_000 * MAX_ADJUSTMENT_FACTOR));
    }

    #[test]
    fn clamps_max_decrease_to_quarter() {
        let window = full_window_size() as usize;
        let ts = vec![1_000_000; window];
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(1_000_000 / MAX_ADJUSTMENT_FACTOR));
    }

    #[test]
    fn clamp_at_exact_4x_boundary() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS * 4);
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(4_000_000));
    }

    #[test]
    fn clamp_at_exact_quarter_boundary() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS / 4);
        let t = target(1_000_000);
        let new = next_target(&ts, t);
        assert_eq!(new, target(250_000));
    }

    // ------------------------------------------------------------------
    // next_target — bounds
    // ------------------------------------------------------------------

    #[test]
    fn result_never_below_min_target() {
        let window = full_window_size() as usize;
        let ts = vec![1_000_000; window]; // instant
        let new = next_target(&ts, target(1)); // 1 / 4 = 0, clamped to MIN_TARGET
        assert_eq!(new, MIN_TARGET);
    }

    #[test]
    fn result_never_above_max_target() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS * 10);
        let new = next_target(&ts, MAX_TARGET);
        assert_eq!(new, MAX_TARGET);
    }

    #[test]
    fn max_target_with_on_target_stays_max() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS);
        assert_eq!(next_target(&ts, MAX_TARGET), MAX_TARGET);
    }

    #[test]
    fn min_target_with_on_target_stays_min() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS);
        assert_eq!(next_target(&ts, MIN_TARGET), MIN_TARGET);
    }

    // ------------------------------------------------------------------
    // next_target — partial windows
    // ------------------------------------------------------------------

    #[test]
    fn two_timestamps_on_target() {
        let ts = vec![1000, 1000 + TARGET_BLOCK_TIME_MS];
        assert_eq!(next_target(&ts, target(500_000)), target(500_000));
    }

    #[test]
    fn two_timestamps_slow() {
        let ts = vec![1000, 1000 + TARGET_BLOCK_TIME_MS * 2];
        assert_eq!(next_target(&ts, target(500_000)), target(1_000_000));
    }

    #[test]
    fn two_timestamps_fast() {
        let ts = vec![1000, 1000 + TARGET_BLOCK_TIME_MS / 2];
        assert_eq!(next_target(&ts, target(500_000)), target(250_000));
    }

    // ------------------------------------------------------------------
    // target_for_height
    // ------------------------------------------------------------------

    #[test]
    fn below_first_boundary_inherits_parent() {
        for h in 0..=ADJUSTMENT_INTERVAL {
            assert_eq!(
                target_for_height(h, target(1000), |_| 0),
                target(1000),
                "height {h} should inherit parent target"
            );
        }
    }

    #[test]
    fn non_boundary_height_inherits_parent() {
        let t = target(1000);
        assert_eq!(target_for_height(ADJUSTMENT_INTERVAL + 1, t, |_| 0), t);
        assert_eq!(target_for_height(ADJUSTMENT_INTERVAL * 2 - 1, t, |_| 0), t);
    }

    #[test]
    fn boundary_height_on_target_stays_same() {
        let height = ADJUSTMENT_INTERVAL * 2;
        let t = target(1_000_000);
        let new = target_for_height(height, t, |h| h * TARGET_BLOCK_TIME_MS);
        assert_eq!(new, t);
    }

    #[test]
    fn boundary_height_slow_blocks_doubles_target() {
        let height = ADJUSTMENT_INTERVAL * 2;
        let t = target(1_000_000);
        let new = target_for_height(height, t, |h| h * TARGET_BLOCK_TIME_MS * 2);
        assert_eq!(new, target(2_000_000));
    }

    #[test]
    fn boundary_height_requests_exact_window() {
        let height = ADJUSTMENT_INTERVAL * 3;
        let expected_start = height - ADJUSTMENT_INTERVAL - 1;
        let t = target(1_000_000);
        let _ = target_for_height(height, t, |h| {
            assert!(
                h >= expected_start && h < height,
                "height {h} out of expected window [{expected_start}, {height})"
            );
            h * TARGET_BLOCK_TIME_MS
        });
    }

    // ------------------------------------------------------------------
    // Constants and helpers
    // ------------------------------------------------------------------

    #[test]
    fn expected_window_time_value() {
        assert_eq!(
            expected_window_time_ms(),
            ADJUSTMENT_INTERVAL * TARGET_BLOCK_TIME_MS
        );
    }

    #[test]
    fn full_window_size_value() {
        assert_eq!(full_window_size(), ADJUSTMENT_INTERVAL + 1);
    }

    #[test]
    fn max_adjustment_factor_value() {
        assert_eq!(MAX_ADJUSTMENT_FACTOR, 4);
    }

    #[test]
    fn min_target_value() {
        assert_eq!(MIN_TARGET, Uint256::ONE);
    }

    #[test]
    fn max_target_value() {
        assert_eq!(MAX_TARGET, Uint256::MAX);
    }

    // ------------------------------------------------------------------
    // Convergence / stability
    // ------------------------------------------------------------------

    #[test]
    fn repeated_on_target_is_stable() {
        let window = full_window_size() as usize;
        let mut t = target(5_000_000);
        for round in 0..10 {
            let ts = spaced_timestamps(1_000_000 + round * 10_000, window, TARGET_BLOCK_TIME_MS);
            t = next_target(&ts, t);
        }
        assert_eq!(t, target(5_000_000));
    }

    #[test]
    fn oscillation_dampened_by_clamp() {
        let window = full_window_size() as usize;
        let t = target(1_000_000);

        let ts_instant = vec![1_000_000; window];
        let after_fast = next_target(&ts_instant, t);
        assert_eq!(after_fast, target(250_000));

        let ts_slow = spaced_timestamps(2_000_000, window, TARGET_BLOCK_TIME_MS * 100);
        let after_slow = next_target(&ts_slow, after_fast);
        assert_eq!(after_slow, target(1_000_000)); // back to original
    }

    // ------------------------------------------------------------------
    // Integer precision
    // ------------------------------------------------------------------

    #[test]
    fn large_target_near_max_does_not_overflow() {
        let window = full_window_size() as usize;
        let ts_slow = spaced_timestamps(1_000_000, window, TARGET_BLOCK_TIME_MS * 4);
        let new = next_target(&ts_slow, MAX_TARGET);
        assert_eq!(new, MAX_TARGET);
    }

    #[test]
    fn small_target_rounding() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1000, window, TARGET_BLOCK_TIME_MS * 2);
        assert_eq!(next_target(&ts, target(3)), target(6));
    }

    #[test]
    fn small_target_truncation() {
        let window = full_window_size() as usize;
        let ts = spaced_timestamps(1000, window, TARGET_BLOCK_TIME_MS / 2);
        assert_eq!(next_target(&ts, target(5)), target(2));
    }

    #[test]
    fn target_one_fast_blocks_stays_at_min() {
        let window = full_window_size() as usize;
        let ts = vec![1_000_000; window];
        assert_eq!(next_target(&ts, target(1)), MIN_TARGET);
    }
}
