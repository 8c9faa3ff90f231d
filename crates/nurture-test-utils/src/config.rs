//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use nurture_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// Starts from the defaults with jitter disabled, so backoff delays are exact.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_requests_per_minute(2)
///     .max_retries(1)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.queue.jitter_ratio = 0.0;
        Self { config }
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.config.completion.base_url = url.to_string();
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.config.completion.model = model.to_string();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.completion.timeout_secs = secs;
        self
    }

    pub fn max_requests_per_minute(mut self, n: u32) -> Self {
        self.config.rate_limit.max_requests_per_minute = n;
        self
    }

    pub fn max_requests_per_hour(mut self, n: u32) -> Self {
        self.config.rate_limit.max_requests_per_hour = n;
        self
    }

    pub fn max_tokens_per_day(mut self, n: u64) -> Self {
        self.config.rate_limit.max_tokens_per_day = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.queue.max_retries = n;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.config.queue.base_delay_ms = base;
        self.config.queue.max_delay_ms = max;
        self
    }

    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.config.queue.jitter_ratio = ratio;
        self
    }

    pub fn max_history(mut self, n: usize) -> Self {
        self.config.context.max_history = n;
        self
    }

    pub fn system_prompt(mut self, prompt: &str) -> Self {
        self.config.context.system_prompt = prompt.to_string();
        self
    }

    pub fn data_dir(mut self, dir: &str) -> Self {
        self.config.storage.data_dir = dir.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
