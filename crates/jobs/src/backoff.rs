//! Retry delay for failed jobs.

use chrono::Duration;

/// Hard ceiling regardless of configuration, keeps `now + delay` in range.
const CEILING_SECS: u64 = 366 * 24 * 3_600;

/// `min(base * 2^(attempts - 1), max)`, never shorter than one second so
/// a retry always lands strictly in the future.
pub fn backoff_delay(attempts: u32, base_secs: u64, max_secs: u64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let secs = base_secs
        .saturating_mul(1u64 << exponent)
        .min(max_secs)
        .clamp(1, CEILING_SECS);
    Duration::seconds(secs as i64)
}
