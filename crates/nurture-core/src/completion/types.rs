//! Request and response vocabulary for chat completions.

use serde::{Deserialize, Serialize};

use crate::message::Role;

/// One `{role, content}` entry of the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: String,
}

impl ApiMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Per-request tuning knobs. Unset fields are omitted from the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Deadline for one attempt; expiry counts as a timeout error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A rendered completion request, as stored in a queued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier; empty means the client's default.
    pub model: String,
    pub messages: Vec<ApiMessage>,
    #[serde(default)]
    pub options: CompletionOptions,
}

/// Token usage reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: ApiMessage,
    /// "stop", "length", "content_filter", ...
    pub finish_reason: Option<String>,
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<TokenUsage>,
}

impl CompletionResponse {
    /// Text of the first choice, if it has any.
    pub fn text(&self) -> Option<&str> {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Total tokens charged, zero when the endpoint did not report usage.
    pub fn total_tokens(&self) -> u64 {
        self.usage.map_or(0, |u| u64::from(u.total_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(content: &str, usage: Option<TokenUsage>) -> CompletionResponse {
        CompletionResponse {
            id: "cmpl-1".to_string(),
            model: "gpt-4-turbo".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ApiMessage::assistant(content),
                finish_reason: Some("stop".to_string()),
            }],
            usage,
        }
    }

    #[test]
    fn test_text_of_first_choice() {
        assert_eq!(response("Hello!", None).text(), Some("Hello!"));
        assert_eq!(response("  ", None).text(), None);
    }

    #[test]
    fn test_total_tokens_defaults_to_zero() {
        assert_eq!(response("x", None).total_tokens(), 0);
        let usage = TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
        };
        assert_eq!(response("x", Some(usage)).total_tokens(), 7);
    }

    #[test]
    fn test_unset_options_are_omitted() {
        let options = CompletionOptions {
            max_tokens: Some(64),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&options).unwrap(), json!({"max_tokens": 64}));
    }
}
