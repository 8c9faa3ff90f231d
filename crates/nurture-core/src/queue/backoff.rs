//! Exponential backoff with proportional jitter.

use std::time::Duration;

use nurture_config::QueueConfig;

use crate::completion::CompletionError;

/// Delay policy between retries of the queue head.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_ratio,
        )
    }

    /// `min(base * 2^retry_count, max)`, before jitter.
    pub fn capped_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Capped delay plus up to `jitter_ratio` of it at random.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let capped = self.capped_delay(retry_count);
        capped + capped.mul_f64(self.jitter_ratio * rand::random::<f64>())
    }

    /// The server's retry-after hint when the error carries one, otherwise [`delay`](Self::delay).
    pub fn delay_for(&self, retry_count: u32, err: &CompletionError) -> Duration {
        err.retry_after().unwrap_or_else(|| self.delay(retry_count))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_delay_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.capped_delay(1), Duration::from_secs(2));
        assert_eq!(policy.capped_delay(2), Duration::from_secs(4));
        assert_eq!(policy.capped_delay(3), Duration::from_secs(8));
        assert_eq!(policy.capped_delay(6), Duration::from_secs(60));
        assert_eq!(policy.capped_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_secs(4), "{d:?}");
            assert!(d <= Duration::from_millis(5_200), "{d:?}");
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 0.0);
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let policy = BackoffPolicy::default();
        let limited = CompletionError::RateLimited {
            retry_after_secs: Some(7),
        };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(7));

        let server = CompletionError::Server {
            status: 502,
            message: String::new(),
        };
        assert!(policy.delay_for(1, &server) >= Duration::from_secs(2));
    }
}
