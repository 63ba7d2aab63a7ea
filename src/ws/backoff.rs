//! Reconnect backoff.
//!
//! `calculate_backoff` is a pure function, deliberately independent of any
//! live connection or RNG state, so it can be asserted against an exact
//! sequence in tests. Jitter is applied only at the live reconnect call site
//! via [`with_jitter`], never inside the pure function.

use std::time::Duration;

use rand::Rng as _;

#[must_use]
pub fn calculate_backoff(n: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    if multiplier <= 0.0 {
        return initial.min(max);
    }
    let scaled = initial.as_secs_f64() * multiplier.powi(i32::try_from(n).unwrap_or(i32::MAX));
    let clamped = scaled.min(max.as_secs_f64()).max(0.0);
    Duration::from_secs_f64(clamped)
}

/// Applies up to +/-10% jitter around a computed delay, to avoid a
/// thundering herd of reconnecting clients synchronized on the same
/// backoff sequence.
#[must_use]
pub fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.9..=1.1);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
