//! Dispatch orchestrator: one user turn in, one placeholder filled later.
//!
//! [`Dispatcher::send_message`] appends the user turn, checks admission,
//! appends an empty assistant placeholder and enqueues the completion. A
//! background worker reads [`TaskOutcome`]s from the queue and writes the
//! answer (or a fixed error text) into the placeholder, addressed by
//! conversation id and message id.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::completion::{CompletionOptions, CompletionRequest};
use crate::context::{ContextError, ContextManager, ConversationContext};
use crate::credentials::{ApiKey, CredentialError, CredentialStore};
use crate::message::{ChatMessage, ConversationId, MessageId, UserProfile};
use crate::queue::{Priority, QueueError, QueuedTask, RequestQueue, TaskId, TaskOutcome};
use crate::rate_limit::{RateLimiter, RemainingQuota};
use crate::storage::StorageError;

/// Placeholder text when the endpoint answered with no content.
pub const EMPTY_RESPONSE_TEXT: &str = "Sorry, I couldn't generate a response.";

/// Placeholder text when the request ultimately failed.
pub const ERROR_RESPONSE_TEXT: &str =
    "Sorry, I encountered an error while processing your request. Please try again later.";

/// Errors returned synchronously from a send or facade call.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,

    #[error("conversation with ID {0} not found")]
    ConversationNotFound(ConversationId),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Per-send knobs.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Priority,
    /// Overrides the configured defaults field by field.
    pub completion: CompletionOptions,
    /// Profile snapshot for a newly created conversation.
    pub profile: Option<UserProfile>,
}

/// What a send hands back immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub conversation_id: ConversationId,
    pub user_message: ChatMessage,
    /// The assistant message that will receive the answer.
    pub placeholder_id: MessageId,
    pub task_id: TaskId,
}

/// Request settings shared by every send.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub model: String,
    pub max_retries: u32,
    pub defaults: CompletionOptions,
}

impl DispatchSettings {
    pub fn from_config(config: &nurture_config::AppConfig) -> Self {
        let completion = &config.completion;
        Self {
            model: completion.model.clone(),
            max_retries: config.queue.max_retries,
            defaults: CompletionOptions {
                max_tokens: completion.max_tokens,
                temperature: Some(completion.temperature),
                timeout_ms: (completion.timeout_secs > 0)
                    .then(|| completion.timeout_secs.saturating_mul(1000)),
                ..Default::default()
            },
        }
    }
}

/// The orchestrator and its facade operations.
pub struct Dispatcher {
    contexts: Arc<ContextManager>,
    limiter: Arc<RateLimiter>,
    queue: RequestQueue,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
    applied: watch::Receiver<u64>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// Wire the orchestrator and spawn the outcome worker on `outcomes`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        settings: DispatchSettings,
        contexts: Arc<ContextManager>,
        limiter: Arc<RateLimiter>,
        queue: RequestQueue,
        outcomes: mpsc::Receiver<TaskOutcome>,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (applied_tx, applied) = watch::channel(0);
        let applier = OutcomeApplier {
            contexts: Arc::clone(&contexts),
            limiter: Arc::clone(&limiter),
            applied: applied_tx,
        };
        let worker = tokio::spawn(applier.run(outcomes));

        Self {
            contexts,
            limiter,
            queue,
            credentials,
            clock,
            settings,
            applied,
            worker,
        }
    }

    /// Resume any persisted queue. Returns whether an API key is available.
    pub async fn initialize(&self) -> Result<bool, DispatchError> {
        let has_key = self.has_api_key().await?;
        if !has_key {
            warn!("no API key configured; completions will fail until one is set");
        }
        self.queue.initialize().await?;
        Ok(has_key)
    }

    pub async fn send_message(
        &self,
        content: &str,
        conversation_id: Option<&ConversationId>,
    ) -> Result<SentMessage, DispatchError> {
        self.send_message_with(content, conversation_id, SendOptions::default())
            .await
    }

    pub async fn send_message_with_priority(
        &self,
        content: &str,
        conversation_id: Option<&ConversationId>,
        priority: Priority,
    ) -> Result<SentMessage, DispatchError> {
        let options = SendOptions {
            priority,
            ..Default::default()
        };
        self.send_message_with(content, conversation_id, options)
            .await
    }

    /// Run one user turn.
    ///
    /// The user message is kept in the conversation even when admission is
    /// denied; nothing is enqueued in that case.
    pub async fn send_message_with(
        &self,
        content: &str,
        conversation_id: Option<&ConversationId>,
        options: SendOptions,
    ) -> Result<SentMessage, DispatchError> {
        let context = self.locate_context(conversation_id, options.profile).await?;
        let conversation_id = context.conversation_id.clone();

        let user_message = ChatMessage::user(content, self.clock.now_millis());
        let context = self
            .contexts
            .update_context_with_message(&context, user_message.clone())
            .await?;

        if !self.limiter.can_make_request().await? {
            info!(conversation = %conversation_id, "send rejected by rate limiter");
            return Err(DispatchError::RateLimited);
        }

        let messages = self.contexts.convert_to_api_messages(&context);

        let placeholder = ChatMessage::placeholder(self.clock.now_millis());
        let placeholder_id = placeholder.id.clone();
        self.contexts
            .update_context_with_message(&context, placeholder)
            .await?;

        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages,
            options: merge_options(options.completion, &self.settings.defaults),
        };
        let task = QueuedTask::new(
            conversation_id.clone(),
            placeholder_id.clone(),
            request,
            options.priority,
            self.clock.now_millis(),
            self.settings.max_retries,
        );
        let task_id = task.id.clone();

        if let Err(e) = self.queue.enqueue(task).await {
            // Nothing will ever fill the placeholder otherwise.
            if let Err(ctx_err) = self
                .contexts
                .replace_message_content(&conversation_id, &placeholder_id, ERROR_RESPONSE_TEXT)
                .await
            {
                error!(error = %ctx_err, "failed to mark placeholder after enqueue failure");
            }
            return Err(e.into());
        }

        debug!(
            conversation = %conversation_id,
            task = %task_id,
            placeholder = %placeholder_id,
            "user turn dispatched"
        );
        Ok(SentMessage {
            conversation_id,
            user_message,
            placeholder_id,
            task_id,
        })
    }

    async fn locate_context(
        &self,
        conversation_id: Option<&ConversationId>,
        profile: Option<UserProfile>,
    ) -> Result<ConversationContext, DispatchError> {
        match conversation_id {
            Some(id) => self
                .contexts
                .get_context(id)
                .await?
                .ok_or_else(|| DispatchError::ConversationNotFound(id.clone())),
            None => Ok(self.contexts.create_new_context(profile).await?),
        }
    }

    // ── Facade ──────────────────────────────────────────────────────

    pub async fn get_conversations(&self) -> Result<Vec<ConversationContext>, DispatchError> {
        Ok(self.contexts.get_all_contexts().await?)
    }

    pub async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationContext>, DispatchError> {
        Ok(self.contexts.get_context(id).await?)
    }

    /// Delete a conversation. Returns whether it existed.
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, DispatchError> {
        Ok(self.contexts.clear_context(id).await?)
    }

    pub async fn get_rate_limit_status(&self) -> Result<RemainingQuota, DispatchError> {
        Ok(self.limiter.get_remaining_requests().await?)
    }

    pub async fn reset_rate_limits(&self) -> Result<(), DispatchError> {
        Ok(self.limiter.reset_limits().await?)
    }

    pub fn get_queue_length(&self) -> usize {
        self.queue.get_queue_length()
    }

    /// Drop pending tasks. Returns how many were dropped.
    pub async fn clear_queue(&self) -> Result<usize, DispatchError> {
        Ok(self.queue.clear().await?)
    }

    pub async fn update_user_profile(&self, profile: &UserProfile) -> Result<usize, DispatchError> {
        Ok(self.contexts.update_user_profile(profile).await?)
    }

    pub async fn set_api_key(&self, key: &str) -> Result<(), DispatchError> {
        Ok(self.credentials.set(ApiKey::new(key.trim())).await?)
    }

    pub async fn clear_api_key(&self) -> Result<(), DispatchError> {
        Ok(self.credentials.delete().await?)
    }

    pub async fn has_api_key(&self) -> Result<bool, DispatchError> {
        Ok(self
            .credentials
            .get()
            .await?
            .is_some_and(|key| !key.is_empty()))
    }

    /// Resolve once the queue is drained and every emitted outcome applied.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
        let target = self.queue.outcomes_sent();
        let mut applied = self.applied.clone();
        // Err only if the worker is gone, in which case nothing more will land.
        let _ = applied.wait_for(|n| *n >= target).await;
    }

    /// Outcomes written back so far.
    pub fn outcomes_applied(&self) -> u64 {
        *self.applied.borrow()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Explicit per-send options win; unset fields fall back to `defaults`.
fn merge_options(explicit: CompletionOptions, defaults: &CompletionOptions) -> CompletionOptions {
    CompletionOptions {
        max_tokens: explicit.max_tokens.or(defaults.max_tokens),
        temperature: explicit.temperature.or(defaults.temperature),
        top_p: explicit.top_p.or(defaults.top_p),
        frequency_penalty: explicit.frequency_penalty.or(defaults.frequency_penalty),
        presence_penalty: explicit.presence_penalty.or(defaults.presence_penalty),
        stop: explicit.stop.or_else(|| defaults.stop.clone()),
        timeout_ms: explicit.timeout_ms.or(defaults.timeout_ms),
    }
}

/// Writes queue outcomes back into contexts and the limiter.
struct OutcomeApplier {
    contexts: Arc<ContextManager>,
    limiter: Arc<RateLimiter>,
    applied: watch::Sender<u64>,
}

impl OutcomeApplier {
    async fn run(self, mut outcomes: mpsc::Receiver<TaskOutcome>) {
        while let Some(outcome) = outcomes.recv().await {
            self.apply(outcome).await;
            self.applied.send_modify(|n| *n += 1);
        }
        debug!("outcome channel closed");
    }

    async fn apply(&self, outcome: TaskOutcome) {
        let content = match &outcome.result {
            Ok(response) => {
                let tokens = response.total_tokens();
                if let Err(e) = self.limiter.record_request(tokens).await {
                    error!(error = %e, "failed to record token usage");
                }
                response.text().unwrap_or(EMPTY_RESPONSE_TEXT).to_string()
            }
            Err(err) => {
                debug!(task = %outcome.task_id, kind = ?err.kind(), "applying failure outcome");
                ERROR_RESPONSE_TEXT.to_string()
            }
        };

        match self
            .contexts
            .replace_message_content(&outcome.conversation_id, &outcome.message_id, content)
            .await
        {
            Ok(Some(_)) => debug!(
                conversation = %outcome.conversation_id,
                message = %outcome.message_id,
                success = outcome.is_success(),
                "placeholder filled"
            ),
            Ok(None) => info!(
                conversation = %outcome.conversation_id,
                task = %outcome.task_id,
                "late outcome for a removed conversation, ignored"
            ),
            Err(e) => error!(
                conversation = %outcome.conversation_id,
                error = %e,
                "failed to apply outcome"
            ),
        }
    }
}
