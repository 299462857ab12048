//! Backoff schedules shared by the database connector and the model client.

use std::time::Duration;

/// Delays for `retries` further attempts: `base * 2^k` for attempt `k`.
pub fn doubling_delays(base: Duration, retries: usize) -> Vec<Duration> {
    (0..retries)
        .map(|k| base.saturating_mul(1u32 << k.min(31)))
        .collect()
}
