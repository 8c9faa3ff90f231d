//! OpenAI-compatible Chat Completions client.
//!
//! Implements [`CompletionClient`] for `POST {base_url}/chat/completions` and
//! maps HTTP failures into [`CompletionError`]. Also works against any
//! endpoint that follows the OpenAI format (Ollama, vLLM, Together AI).

use std::sync::Arc;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::credentials::CredentialStore;
use crate::message::Role;

use super::client::{CompletionClient, CompletionError};
use super::types::*;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Seconds to wait on a 429 that carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// OpenAI-compatible completion client.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    default_model: String,
    default_temperature: f32,
    credentials: Arc<dyn CredentialStore>,
}

impl OpenAiClient {
    /// Create a client that reads its bearer token from `credentials` on each call.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            client: Client::new(),
            base_url: OPENAI_BASE_URL.to_string(),
            default_model: "gpt-4-turbo".to_string(),
            default_temperature: 0.7,
            credentials,
        }
    }

    /// Set the model used when a request leaves it empty.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set the base URL (`/chat/completions` is appended).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Temperature sent when a request does not specify one.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = temperature;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request_body(&self, request: &CompletionRequest) -> WireRequest {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };
        let options = &request.options;

        WireRequest {
            model,
            messages: request.messages.clone(),
            max_tokens: options.max_tokens,
            temperature: options.temperature.unwrap_or(self.default_temperature),
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            stream: false,
            stop: options.stop.clone(),
        }
    }

    fn parse_response(resp: WireResponse) -> CompletionResponse {
        CompletionResponse {
            id: resp.id,
            model: resp.model.unwrap_or_default(),
            choices: resp
                .choices
                .into_iter()
                .enumerate()
                .map(|(i, c)| Choice {
                    index: c.index.unwrap_or(i as u32),
                    message: ApiMessage {
                        role: c.message.role.unwrap_or(Role::Assistant),
                        content: c.message.content.unwrap_or_default(),
                    },
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: resp.usage,
        }
    }
}

impl CompletionClient for OpenAiClient {
    fn name(&self) -> &str {
        "OpenAI"
    }

    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionResponse, CompletionError>> {
        let body = self.build_request_body(request);
        Box::pin(async move {
            if body.messages.is_empty() {
                return Err(CompletionError::InvalidRequest(
                    "request has no messages".to_string(),
                ));
            }

            let key = self
                .credentials
                .get()
                .await
                .map_err(|e| CompletionError::Authentication(e.to_string()))?
                .ok_or_else(|| CompletionError::Authentication("API key not set".to_string()))?;

            debug!(model = %body.model, messages = body.messages.len(), "chat completion request");

            let resp = self
                .client
                .post(self.endpoint())
                .bearer_auth(key.expose())
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            if !resp.status().is_success() {
                return Err(status_error(resp).await);
            }

            let api_resp: WireResponse = resp
                .json()
                .await
                .map_err(|e| CompletionError::Unknown(format!("unreadable response: {e}")))?;

            Ok(Self::parse_response(api_resp))
        })
    }
}

fn transport_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout
    } else if err.is_builder() {
        CompletionError::InvalidRequest(err.to_string())
    } else {
        CompletionError::Network(err.to_string())
    }
}

/// Map a non-2xx response into the error taxonomy.
async fn status_error(resp: Response) -> CompletionError {
    let status = resp.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return CompletionError::RateLimited {
            retry_after_secs: Some(retry_after),
        };
    }
    if status == StatusCode::UNAUTHORIZED {
        return CompletionError::Authentication("invalid API key".to_string());
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<WireErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty());

    if status.is_server_error() {
        warn!(status = status.as_u16(), "completion endpoint unavailable");
        return CompletionError::Server {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| "AI service unavailable".to_string()),
        };
    }

    CompletionError::Api {
        status: status.as_u16(),
        message: message.unwrap_or_else(|| "Unknown API error".to_string()),
    }
}

// ── Wire types (private) ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: Option<u32>,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    error: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    message: Option<String>,
}
