//! Backoff configuration and delay calculation.
//!
//! Both reconnection and subscription retries share one formula:
//!
//! `min(base * 2^min(attempt, exponent_cap) + random(0..jitter), max)`
//!
//! The jitter is additive, so the jitter-free part is monotone in `attempt`.
//! [`calculate_backoff_delay_with_random`] takes the random sample explicitly
//! and is what the tests exercise. [`BackoffConfig::delay`] draws it from
//! `rand`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default maximum additive jitter in milliseconds.
pub const DEFAULT_JITTER_MS: u64 = 1000;
/// Default cap on the exponent.
pub const DEFAULT_EXPONENT_CAP: u32 = 5;

/// Backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay for attempt 0 before jitter.
    pub base_delay_ms: u64,
    /// Upper bound on the delay, jitter included.
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) of the additive jitter.
    pub jitter_ms: u64,
    /// Attempts beyond this value stop doubling.
    pub exponent_cap: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ms: DEFAULT_JITTER_MS,
            exponent_cap: DEFAULT_EXPONENT_CAP,
        }
    }
}

impl BackoffConfig {
    /// Delay for `attempt` using a fresh random sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Delay for `attempt` with an explicit sample in `[0.0, 1.0)`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_ms,
            self.exponent_cap,
            random,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Jitter-free part of the delay.
#[must_use]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    exponent_cap: u32,
) -> u64 {
    let exponent = attempt.min(exponent_cap).min(31);
    base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(max_delay_ms)
}

/// Full delay with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG. Values outside
/// that range are clamped.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ms: u64,
    exponent_cap: u32,
    random: f64,
) -> u64 {
    let base = calculate_backoff_delay(attempt, base_delay_ms, u64::MAX, exponent_cap);
    let jitter = ((jitter_ms as f64) * random.clamp(0.0, 1.0)).floor() as u64;
    base.saturating_add(jitter.min(jitter_ms.saturating_sub(1)))
        .min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.jitter_ms, 1000);
        assert_eq!(config.exponent_cap, 5);
    }

    #[test]
    fn serde_defaults() {
        let config: BackoffConfig = serde_json::from_str(r#"{"baseDelayMs": 500}"#).unwrap();
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let delays: Vec<u64> = (0..6)
            .map(|a| calculate_backoff_delay_with_random(a, 1000, 30_000, 1000, 5, 0.0))
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000]);
    }

    #[test]
    fn exponent_is_capped() {
        let at_cap = calculate_backoff_delay(5, 100, u64::MAX, 5);
        let beyond = calculate_backoff_delay(12, 100, u64::MAX, 5);
        assert_eq!(at_cap, 3200);
        assert_eq!(beyond, 3200);
    }

    #[test]
    fn first_retry_window() {
        // Attempt 0 lands in [1000, 2000).
        let low = calculate_backoff_delay_with_random(0, 1000, 30_000, 1000, 5, 0.0);
        let high = calculate_backoff_delay_with_random(0, 1000, 30_000, 1000, 5, 0.999_999);
        assert_eq!(low, 1000);
        assert_eq!(high, 1999);
    }

    #[test]
    fn random_out_of_range_is_clamped() {
        let d = calculate_backoff_delay_with_random(0, 1000, 30_000, 1000, 5, 7.0);
        assert_eq!(d, 1999);
        let d = calculate_backoff_delay_with_random(0, 1000, 30_000, 1000, 5, -1.0);
        assert_eq!(d, 1000);
    }

    #[test]
    fn zero_jitter() {
        let d = calculate_backoff_delay_with_random(1, 1000, 30_000, 0, 5, 0.5);
        assert_eq!(d, 2000);
    }

    #[test]
    fn config_delay_is_in_window() {
        let config = BackoffConfig::default();
        for _ in 0..50 {
            let d = config.delay(0);
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(2000));
        }
    }

    proptest! {
        #[test]
        fn monotone_without_jitter(a in 0u32..40, b in 0u32..40) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let d_lo = calculate_backoff_delay(lo, 1000, 30_000, 5);
            let d_hi = calculate_backoff_delay(hi, 1000, 30_000, 5);
            prop_assert!(d_lo <= d_hi);
        }

        #[test]
        fn never_exceeds_max(attempt in 0u32..1000, random in 0.0f64..1.0) {
            let d = calculate_backoff_delay_with_random(attempt, 1000, 30_000, 1000, 5, random);
            prop_assert!(d <= 30_000);
        }

        #[test]
        fn constant_past_cap(attempt in 5u32..1000) {
            prop_assert_eq!(
                calculate_backoff_delay(attempt, 1000, 30_000, 5),
                calculate_backoff_delay(5, 1000, 30_000, 5)
            );
        }
    }
}
