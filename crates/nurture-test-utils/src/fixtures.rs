//! A scripted [`CompletionClient`] and response fixtures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};

use nurture_core::BoxFuture;
use nurture_core::completion::{
    ApiMessage, Choice, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
    TokenUsage,
};
use nurture_core::message::Role;

type Reply = Result<CompletionResponse, CompletionError>;

/// A successful response whose first choice is `text`.
pub fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        id: "cmpl-test".to_string(),
        model: "test-model".to_string(),
        choices: vec![Choice {
            index: 0,
            message: ApiMessage::assistant(text),
            finish_reason: Some("stop".to_string()),
        }],
        usage: None,
    }
}

/// Like [`text_response`], reporting `total_tokens` of usage.
pub fn response_with_usage(text: &str, total_tokens: u32) -> CompletionResponse {
    CompletionResponse {
        usage: Some(TokenUsage {
            prompt_tokens: total_tokens / 2,
            completion_tokens: total_tokens - total_tokens / 2,
            total_tokens,
        }),
        ..text_response(text)
    }
}

pub fn server_error() -> CompletionError {
    CompletionError::Server {
        status: 503,
        message: "AI service unavailable".to_string(),
    }
}

pub fn auth_error() -> CompletionError {
    CompletionError::Authentication("invalid API key".to_string())
}

/// Holds back scripted replies until released.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    /// Let `n` more calls through.
    pub fn release(&self, n: usize) {
        self.0.add_permits(n);
    }

    /// Let every future call through.
    pub fn open(&self) {
        self.0.add_permits(1 << 20);
    }
}

/// Completion client that replays a script, then a fallback reply.
///
/// Every call is recorded before the reply is produced, so a test can wait
/// for a call to be in flight while the client is gated.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: watch::Sender<usize>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

impl ScriptedClient {
    /// Replies "ok" to every call.
    pub fn new() -> Self {
        Self::always(Ok(text_response("ok")))
    }

    pub fn always(reply: Reply) -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: reply,
            requests: Mutex::new(Vec::new()),
            calls,
            gate: None,
            delay: None,
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::always(Ok(text_response(text)))
    }

    pub fn failing(err: CompletionError) -> Self {
        Self::always(Err(err))
    }

    /// Queue a one-off reply ahead of the fallback.
    pub fn then(self, reply: Reply) -> Self {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(reply);
        self
    }

    /// Hold every call until the returned [`Gate`] releases it.
    pub fn gated(mut self) -> (Self, Gate) {
        let semaphore = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&semaphore));
        (self, Gate(semaphore))
    }

    /// Sleep before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.calls.subscribe();
        rx.wait_for(|calls| *calls >= n)
            .await
            .expect("call counter closed");
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }

    /// Content of the final user message of each request, in call order.
    pub fn user_prompts(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| {
                r.messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
            })
            .collect()
    }
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: &CompletionRequest) -> BoxFuture<'_, Reply> {
        let request = request.clone();
        Box::pin(async move {
            self.requests
                .lock()
                .expect("request log poisoned")
                .push(request);
            self.calls.send_modify(|n| *n += 1);

            if let Some(gate) = &self.gate
                && let Ok(permit) = gate.acquire().await
            {
                permit.forget();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self
                .script
                .lock()
                .expect("script lock poisoned")
                .pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        })
    }
}
