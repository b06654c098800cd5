//! Exponential backoff between delivery attempts.

use std::time::Duration;

/// Delay before re-inserting an entry that failed with `retry_count`
/// previous retries: `base * 2^retry_count`, saturating instead of
/// overflowing.
///
/// | retry_count | delay (base = 1s) |
/// |-------------|-------------------|
/// | 0           | 1s                |
/// | 1           | 2s                |
/// | 2           | 4s                |
/// | 3           | 8s                |
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    let multiplier = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier)
}
