#![deny(unsafe_code)]

//! Configuration loading and validation for the Nurture dispatch core.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is the
//! central configuration structure; every section has serde defaults so an
//! empty file is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// System prompt used when a conversation carries no override.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful pregnancy assistant providing evidence-based information. Always clarify that you're providing general information and not medical advice.";

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion endpoint configuration.
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Local admission limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Request queue retry policy.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Conversation context configuration.
    #[serde(default)]
    pub context: ContextConfig,

    /// Durable storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Base URL; `/chat/completions` is appended per request.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature (0.0–2.0).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Optional cap on generated tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds (0 = no timeout).
    #[serde(default)]
    pub timeout_secs: u64,

    /// Environment variable consulted for the bearer token when none is stored.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: 0,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_api_key_env() -> String {
    "NURTURE_API_KEY".to_string()
}

/// Rolling-window admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per rolling minute.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Requests allowed per rolling hour.
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,

    /// Total tokens (prompt plus completion) allowed per rolling day.
    #[serde(default = "default_max_tokens_per_day")]
    pub max_tokens_per_day: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
            max_requests_per_hour: default_max_requests_per_hour(),
            max_tokens_per_day: default_max_tokens_per_day(),
        }
    }
}

fn default_max_requests_per_minute() -> u32 {
    10
}

fn default_max_requests_per_hour() -> u32 {
    100
}

fn default_max_tokens_per_day() -> u64 {
    100_000
}

/// Retry and backoff policy for the request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retries after the initial attempt for retryable failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base in milliseconds; doubled per retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on the exponential part of the backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum random jitter as a fraction of the computed delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.3
}

/// Conversation context configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Messages kept in each persisted conversation.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Base system prompt for conversations without an override.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_max_history() -> usize {
    20
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one JSON file per storage key.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let completion = &self.completion;
        if !completion.base_url.starts_with("http://")
            && !completion.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation(format!(
                "completion.base_url must be an http(s) URL, got {:?}",
                completion.base_url
            )));
        }
        if completion.model.is_empty() {
            return Err(ConfigError::Validation(
                "completion.model must not be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&completion.temperature) {
            return Err(ConfigError::Validation(format!(
                "completion.temperature must be in [0.0, 2.0], got {}",
                completion.temperature
            )));
        }
        if completion.max_tokens == Some(0) {
            return Err(ConfigError::Validation(
                "completion.max_tokens must be non-zero when set".to_string(),
            ));
        }

        let limits = &self.rate_limit;
        if limits.max_requests_per_minute == 0
            || limits.max_requests_per_hour == 0
            || limits.max_tokens_per_day == 0
        {
            return Err(ConfigError::Validation(
                "rate_limit maxima must all be non-zero".to_string(),
            ));
        }

        let queue = &self.queue;
        if queue.base_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "queue.base_delay_ms must be non-zero".to_string(),
            ));
        }
        if queue.max_delay_ms < queue.base_delay_ms {
            return Err(ConfigError::Validation(format!(
                "queue.max_delay_ms ({}) must be >= queue.base_delay_ms ({})",
                queue.max_delay_ms, queue.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&queue.jitter_ratio) {
            return Err(ConfigError::Validation(format!(
                "queue.jitter_ratio must be in [0.0, 1.0], got {}",
                queue.jitter_ratio
            )));
        }

        if self.context.max_history == 0 {
            return Err(ConfigError::Validation(
                "context.max_history must be at least 1".to_string(),
            ));
        }
        if self.context.system_prompt.trim().is_empty() {
            return Err(ConfigError::Validation(
                "context.system_prompt must not be empty".to_string(),
            ));
        }

        if self.storage.data_dir.is_empty() {
            return Err(ConfigError::Validation(
                "storage.data_dir must not be empty".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}
