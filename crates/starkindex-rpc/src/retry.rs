//! Exponential backoff policy with bounded jitter.

use std::time::Duration;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to the backoff on each retry.
    pub multiplier: f64,
    /// Spread the delay by ±`jitter_fraction * backoff`.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

/// Stateless policy — computes the delay for a given 1-based attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry, or `None` once the
    /// retry budget is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.config.max_retries {
            return None;
        }
        Some(self.delay_for(attempt))
    }

    /// The delay for `attempt` ignoring the retry budget. Used by callers
    /// that retry indefinitely (the live reconnect loop).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);

        // Deterministic jitter spread over [-fraction, +fraction], derived
        // from a multiplicative hash of the attempt counter.
        let unit = (attempt.wrapping_mul(2_654_435_761) % 1000) as f64 / 1000.0;
        let jitter = capped * self.config.jitter_fraction * (2.0 * unit - 1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn delays_double_until_budget() {
        let policy = no_jitter(3);
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 500);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 1000);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 2000);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = no_jitter(20);
        assert_eq!(policy.next_delay(12).unwrap().as_millis(), 30_000);
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::new(RetryConfig::default());
        for attempt in 1..=10 {
            let d = policy.delay_for(attempt).as_millis() as f64;
            let base = (500.0 * 2f64.powi(attempt as i32 - 1)).min(30_000.0);
            assert!(d >= base * 0.8 - 1.0, "attempt {attempt}: {d} below band");
            assert!(d <= base * 1.2 + 1.0, "attempt {attempt}: {d} above band");
        }
    }

    #[test]
    fn indefinite_delay_available_past_budget() {
        let policy = no_jitter(2);
        assert!(policy.next_delay(5).is_none());
        assert_eq!(policy.delay_for(5).as_millis(), 8000);
    }
}
