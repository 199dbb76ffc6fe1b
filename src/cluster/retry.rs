//! Backoff for membership provider failures

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::SwarmError;

/// Exponential backoff with optional full jitter. Never gives up: the
/// reconciler keeps retrying for as long as the process runs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: multiplier.max(1.0),
            jitter,
        }
    }

    /// Delay before retry number `attempt` (starting at 1) after `error`.
    pub fn delay_for(&self, attempt: u32, error: &SwarmError) -> Duration {
        // An expired cursor only means "list again"; the provider itself is fine.
        if matches!(error, SwarmError::CursorExpired) {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64) as u64;
        let millis = if self.jitter && capped > 0 {
            rand::rng().random_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
            config.jitter,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, false);
        let err = SwarmError::provider("unreachable");
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4, &err), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, true);
        let err = SwarmError::provider("unreachable");
        for _ in 0..100 {
            let delay = policy.delay_for(3, &err);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_expired_cursor_retries_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(5, &SwarmError::CursorExpired), Duration::ZERO);
    }
}
