//! Completion client trait and the error taxonomy shared by every backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BoxFuture;

use super::types::{CompletionRequest, CompletionResponse};

/// Coarse classification of a failed completion, as persisted and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NetworkError,
    Timeout,
    RateLimit,
    AuthenticationError,
    InvalidRequest,
    ServerError,
    ApiError,
    Unknown,
}

impl ErrorKind {
    /// Transient failures the queue retries with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
        )
    }
}

/// Errors from completion calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompletionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unknown error: {0}")]
    Unknown(String),
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(": retry after {secs}s"),
        None => String::new(),
    }
}

impl CompletionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::Network(_) => ErrorKind::NetworkError,
            CompletionError::Timeout => ErrorKind::Timeout,
            CompletionError::RateLimited { .. } => ErrorKind::RateLimit,
            CompletionError::Authentication(_) => ErrorKind::AuthenticationError,
            CompletionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            CompletionError::Server { .. } => ErrorKind::ServerError,
            CompletionError::Api { .. } => ErrorKind::ApiError,
            CompletionError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-provided wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CompletionError::RateLimited {
                retry_after_secs: Some(secs),
            } if *secs > 0 => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// HTTP status that produced the error, when there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            CompletionError::RateLimited { .. } => Some(429),
            CompletionError::Server { status, .. } | CompletionError::Api { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// A backend able to answer chat completion requests.
///
/// Uses `BoxFuture` so the queue can hold an `Arc<dyn CompletionClient>`.
pub trait CompletionClient: Send + Sync {
    /// Display name (e.g. "OpenAI").
    fn name(&self) -> &str;

    /// Perform one non-streaming completion attempt.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionResponse, CompletionError>>;
}
