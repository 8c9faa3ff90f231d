//! Rolling-window admission limits for outbound completions.
//!
//! Three independent windows are tracked:
//!
//! | window | counts   | length |
//! |--------|----------|--------|
//! | minute | requests | 60s    |
//! | hour   | requests | 3600s  |
//! | day    | tokens   | 86400s |
//!
//! Each window rolls forward lazily: whenever the state is read, a window
//! whose start is at least one window length in the past has its counter
//! zeroed and its start moved to "now". Windows roll independently.
//!
//! [`RateLimitState`] is the pure state machine over epoch milliseconds;
//! [`RateLimiter`] persists it under [`RATE_LIMIT_STORAGE_KEY`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use nurture_config::RateLimitConfig;

use crate::clock::Clock;
use crate::storage::{KvStore, StorageError, load_json_or_discard, save_json};

/// Storage key of the persisted [`RateLimitState`].
pub const RATE_LIMIT_STORAGE_KEY: &str = "ai_rate_limit_state";

pub const MINUTE_MS: u64 = 60 * 1000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Counters and window starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub requests_this_minute: u32,
    pub minute_start: u64,
    pub requests_this_hour: u32,
    pub hour_start: u64,
    pub tokens_today: u64,
    pub day_start: u64,
}

/// Remaining headroom per window, clamped at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingQuota {
    pub minute_remaining: u32,
    pub hour_remaining: u32,
    pub tokens_remaining: u64,
}

impl RateLimitState {
    /// All counters at zero with every window starting at `now`.
    pub fn fresh(now: u64) -> Self {
        Self {
            requests_this_minute: 0,
            minute_start: now,
            requests_this_hour: 0,
            hour_start: now,
            tokens_today: 0,
            day_start: now,
        }
    }

    /// Reset every window whose length has elapsed since its start.
    ///
    /// A clock that moved backwards never triggers a reset.
    pub fn roll_forward(&mut self, now: u64) {
        if now.saturating_sub(self.minute_start) >= MINUTE_MS {
            self.requests_this_minute = 0;
            self.minute_start = now;
        }
        if now.saturating_sub(self.hour_start) >= HOUR_MS {
            self.requests_this_hour = 0;
            self.hour_start = now;
        }
        if now.saturating_sub(self.day_start) >= DAY_MS {
            self.tokens_today = 0;
            self.day_start = now;
        }
    }

    /// Whether a new request fits under every limit.
    pub fn admits(&self, config: &RateLimitConfig) -> bool {
        self.requests_this_minute < config.max_requests_per_minute
            && self.requests_this_hour < config.max_requests_per_hour
            && self.tokens_today < config.max_tokens_per_day
    }

    /// Count one attempted request and its token usage.
    pub fn record(&mut self, tokens: u64) {
        self.requests_this_minute = self.requests_this_minute.saturating_add(1);
        self.requests_this_hour = self.requests_this_hour.saturating_add(1);
        self.tokens_today = self.tokens_today.saturating_add(tokens);
    }

    pub fn remaining(&self, config: &RateLimitConfig) -> RemainingQuota {
        RemainingQuota {
            minute_remaining: config
                .max_requests_per_minute
                .saturating_sub(self.requests_this_minute),
            hour_remaining: config
                .max_requests_per_hour
                .saturating_sub(self.requests_this_hour),
            tokens_remaining: config.max_tokens_per_day.saturating_sub(self.tokens_today),
        }
    }
}

/// Persistent rate limiter.
///
/// All read-modify-write cycles hold `lock`, so concurrent callers never lose
/// an increment.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Load the persisted state and roll its windows forward to `now`.
    async fn current_state(&self, now: u64) -> Result<RateLimitState, StorageError> {
        let mut state = load_json_or_discard::<RateLimitState>(
            self.store.as_ref(),
            RATE_LIMIT_STORAGE_KEY,
        )
        .await?
        .unwrap_or_else(|| RateLimitState::fresh(now));
        state.roll_forward(now);
        Ok(state)
    }

    /// Admission check: `false` when any window is exhausted.
    pub async fn can_make_request(&self) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let state = self.current_state(self.clock.now_millis()).await?;
        let admitted = state.admits(&self.config);
        if !admitted {
            debug!(
                minute = state.requests_this_minute,
                hour = state.requests_this_hour,
                tokens = state.tokens_today,
                "admission denied by local rate limit"
            );
        }
        Ok(admitted)
    }

    /// Record one attempted request. Call once per request, not per retry.
    pub async fn record_request(&self, token_count: u64) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut state = self.current_state(self.clock.now_millis()).await?;
        state.record(token_count);
        save_json(self.store.as_ref(), RATE_LIMIT_STORAGE_KEY, &state).await?;
        debug!(
            tokens = token_count,
            tokens_today = state.tokens_today,
            "recorded completion request"
        );
        Ok(())
    }

    /// Remaining headroom per window.
    pub async fn get_remaining_requests(&self) -> Result<RemainingQuota, StorageError> {
        let _guard = self.lock.lock().await;
        let state = self.current_state(self.clock.now_millis()).await?;
        Ok(state.remaining(&self.config))
    }

    /// Zero every counter and restart all windows now.
    pub async fn reset_limits(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let state = RateLimitState::fresh(self.clock.now_millis());
        save_json(self.store.as_ref(), RATE_LIMIT_STORAGE_KEY, &state).await?;
        info!("rate limits reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const T0: u64 = 1_000_000_000;

    fn config(per_minute: u32, per_hour: u32, tokens: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_minute: per_minute,
            max_requests_per_hour: per_hour,
            max_tokens_per_day: tokens,
        }
    }

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = RateLimiter::new(config, Arc::new(MemoryStore::new()), clock.clone());
        (limiter, clock)
    }

    // ── Pure state machine ──────────────────────────────────────────

    #[test]
    fn test_minute_limit_closes_exactly_at_max() {
        let config = config(3, 100, 100_000);
        let mut state = RateLimitState::fresh(T0);
        for i in 0..3 {
            assert!(state.admits(&config), "request {i} should be admitted");
            state.roll_forward(T0 + 1_000 * i);
            state.record(0);
        }
        assert!(!state.admits(&config));
    }

    #[test]
    fn test_minute_window_reopens_only_after_elapsing() {
        let config = config(1, 100, 100_000);
        let mut state = RateLimitState::fresh(T0);
        state.record(0);

        state.roll_forward(T0 + MINUTE_MS - 1);
        assert!(!state.admits(&config));

        state.roll_forward(T0 + MINUTE_MS);
        assert!(state.admits(&config));
        assert_eq!(state.minute_start, T0 + MINUTE_MS);
    }

    #[test]
    fn test_windows_roll_independently() {
        let mut state = RateLimitState::fresh(T0);
        state.record(500);
        state.record(500);

        state.roll_forward(T0 + MINUTE_MS);
        assert_eq!(state.requests_this_minute, 0);
        assert_eq!(state.requests_this_hour, 2);
        assert_eq!(state.tokens_today, 1_000);
        assert_eq!(state.hour_start, T0);
        assert_eq!(state.day_start, T0);

        state.roll_forward(T0 + HOUR_MS);
        assert_eq!(state.requests_this_hour, 0);
        assert_eq!(state.tokens_today, 1_000);

        state.roll_forward(T0 + DAY_MS);
        assert_eq!(state.tokens_today, 0);
        assert_eq!(state.day_start, T0 + DAY_MS);
    }

    #[test]
    fn test_backwards_clock_does_not_reset() {
        let mut state = RateLimitState::fresh(T0);
        state.record(10);
        state.roll_forward(T0 - DAY_MS);
        assert_eq!(state.requests_this_minute, 1);
        assert_eq!(state.tokens_today, 10);
    }

    #[test]
    fn test_token_budget_blocks() {
        let config = config(10, 100, 1_000);
        let mut state = RateLimitState::fresh(T0);
        state.record(999);
        assert!(state.admits(&config));
        state.record(1);
        assert!(!state.admits(&config));
    }

    #[test]
    fn test_remaining_is_clamped() {
        let config = config(2, 3, 100);
        let mut state = RateLimitState::fresh(T0);
        state.record(250);
        state.record(0);
        state.record(0);
        assert_eq!(
            state.remaining(&config),
            RemainingQuota {
                minute_remaining: 0,
                hour_remaining: 0,
                tokens_remaining: 0,
            }
        );
    }

    // ── Persistent limiter ──────────────────────────────────────────

    #[tokio::test]
    async fn test_limiter_denies_after_max_and_recovers() {
        let (limiter, clock) = limiter(config(2, 100, 100_000));

        assert!(limiter.can_make_request().await.unwrap());
        limiter.record_request(10).await.unwrap();
        assert!(limiter.can_make_request().await.unwrap());
        limiter.record_request(10).await.unwrap();
        assert!(!limiter.can_make_request().await.unwrap());

        clock.advance(Duration::from_secs(59));
        assert!(!limiter.can_make_request().await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.can_make_request().await.unwrap());
    }

    #[tokio::test]
    async fn test_checks_do_not_consume() {
        let (limiter, _clock) = limiter(config(1, 100, 100_000));
        for _ in 0..5 {
            assert!(limiter.can_make_request().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let (limiter, _clock) = limiter(RateLimitConfig::default());
        limiter.record_request(1_500).await.unwrap();

        let remaining = limiter.get_remaining_requests().await.unwrap();
        assert_eq!(
            remaining,
            RemainingQuota {
                minute_remaining: 9,
                hour_remaining: 99,
                tokens_remaining: 98_500,
            }
        );

        limiter.reset_limits().await.unwrap();
        let remaining = limiter.get_remaining_requests().await.unwrap();
        assert_eq!(remaining.minute_remaining, 10);
        assert_eq!(remaining.tokens_remaining, 100_000);
    }

    #[tokio::test]
    async fn test_state_survives_new_limiter_instance() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let config = config(1, 100, 100_000);

        RateLimiter::new(config.clone(), store.clone(), clock.clone())
            .record_request(0)
            .await
            .unwrap();

        let reopened = RateLimiter::new(config, store, clock);
        assert!(!reopened.can_make_request().await.unwrap());
    }
}
