//! Persistent conversation contexts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use nurture_config::ContextConfig;

use crate::clock::Clock;
use crate::completion::ApiMessage;
use crate::message::{ChatMessage, ConversationId, MessageId, UserProfile};
use crate::storage::{KvStore, StorageError, load_json_or_discard, save_json};

use super::prompt;

/// Storage key of the conversation map.
pub const CONTEXT_STORAGE_KEY: &str = "ai_context";

type ContextMap = BTreeMap<ConversationId, ConversationContext>;

/// Errors from context operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One conversation's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: ConversationId,
    /// Oldest first; capped at the configured history length when persisted.
    #[serde(default)]
    pub message_history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<UserProfile>,
    /// Replaces the base system prompt for this conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pregnancy_week: Option<u32>,
    #[serde(default)]
    pub created_at: u64,
}

impl ConversationContext {
    pub fn new(id: ConversationId, profile: Option<UserProfile>, created_at: u64) -> Self {
        let pregnancy_week = profile.as_ref().and_then(|p| p.current_week_of_pregnancy);
        Self {
            conversation_id: id,
            message_history: Vec::new(),
            user_profile: profile,
            system_prompt: None,
            pregnancy_week,
            created_at,
        }
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.message_history.last()
    }

    fn truncate(&mut self, max_history: usize) {
        let len = self.message_history.len();
        if len > max_history {
            self.message_history.drain(..len - max_history);
        }
    }
}

/// Owns the persisted conversation map.
///
/// Read-modify-write cycles on the map are serialized by `lock`.
pub struct ContextManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    max_history: usize,
    base_prompt: String,
    lock: Mutex<()>,
}

impl ContextManager {
    pub fn new(config: &ContextConfig, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_history: config.max_history.max(1),
            base_prompt: config.system_prompt.clone(),
            lock: Mutex::new(()),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    async fn load_all(&self) -> Result<ContextMap, StorageError> {
        Ok(load_json_or_discard::<ContextMap>(self.store.as_ref(), CONTEXT_STORAGE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn store_all(&self, contexts: &ContextMap) -> Result<(), StorageError> {
        save_json(self.store.as_ref(), CONTEXT_STORAGE_KEY, contexts).await
    }

    /// Create and persist an empty conversation.
    pub async fn create_new_context(
        &self,
        profile: Option<UserProfile>,
    ) -> Result<ConversationContext, ContextError> {
        let _guard = self.lock.lock().await;
        let context =
            ConversationContext::new(ConversationId::generate(), profile, self.clock.now_millis());

        let mut contexts = self.load_all().await?;
        contexts.insert(context.conversation_id.clone(), context.clone());
        self.store_all(&contexts).await?;

        info!(conversation = %context.conversation_id, "created conversation");
        Ok(context)
    }

    pub async fn get_context(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationContext>, ContextError> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all().await?.remove(id))
    }

    /// Persist `context` as given, truncated to the history cap.
    pub async fn save_context(&self, context: &ConversationContext) -> Result<(), ContextError> {
        let _guard = self.lock.lock().await;
        let mut contexts = self.load_all().await?;
        let mut context = context.clone();
        context.truncate(self.max_history);
        contexts.insert(context.conversation_id.clone(), context);
        self.store_all(&contexts).await?;
        Ok(())
    }

    /// Append `message` to the conversation of `context` and persist.
    ///
    /// The persisted copy is the base when it exists, so concurrent appends
    /// never drop each other. Returns the persisted result.
    pub async fn update_context_with_message(
        &self,
        context: &ConversationContext,
        message: ChatMessage,
    ) -> Result<ConversationContext, ContextError> {
        let _guard = self.lock.lock().await;
        let mut contexts = self.load_all().await?;

        let mut updated = contexts
            .remove(&context.conversation_id)
            .unwrap_or_else(|| context.clone());
        debug!(
            conversation = %updated.conversation_id,
            message = %message.id,
            role = %message.role,
            "appending message"
        );
        updated.message_history.push(message);
        updated.truncate(self.max_history);

        contexts.insert(updated.conversation_id.clone(), updated.clone());
        self.store_all(&contexts).await?;
        Ok(updated)
    }

    /// Overwrite the content of one message in place.
    ///
    /// Returns the updated message, or `None` when the conversation was
    /// deleted or the message already fell out of the history window.
    pub async fn replace_message_content(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<Option<ChatMessage>, ContextError> {
        let _guard = self.lock.lock().await;
        let mut contexts = self.load_all().await?;

        let Some(message) = contexts
            .get_mut(conversation_id)
            .and_then(|ctx| ctx.message_history.iter_mut().find(|m| m.id == *message_id))
        else {
            debug!(
                conversation = %conversation_id,
                message = %message_id,
                "message no longer present, dropping update"
            );
            return Ok(None);
        };

        message.content = content.into();
        message.timestamp = self.clock.now_millis();
        let updated = message.clone();

        self.store_all(&contexts).await?;
        Ok(Some(updated))
    }

    /// Delete a conversation. Returns whether it existed.
    pub async fn clear_context(&self, id: &ConversationId) -> Result<bool, ContextError> {
        let _guard = self.lock.lock().await;
        let mut contexts = self.load_all().await?;
        let existed = contexts.remove(id).is_some();
        if existed {
            self.store_all(&contexts).await?;
            info!(conversation = %id, "deleted conversation");
        }
        Ok(existed)
    }

    /// Every conversation, oldest first.
    pub async fn get_all_contexts(&self) -> Result<Vec<ConversationContext>, ContextError> {
        let _guard = self.lock.lock().await;
        let mut all: Vec<ConversationContext> = self.load_all().await?.into_values().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    /// Replace the profile snapshot in every conversation that carries one.
    ///
    /// Returns the number of conversations updated.
    pub async fn update_user_profile(&self, profile: &UserProfile) -> Result<usize, ContextError> {
        let _guard = self.lock.lock().await;
        let mut contexts = self.load_all().await?;

        let mut updated = 0;
        for context in contexts.values_mut() {
            if context.user_profile.is_some() {
                context.user_profile = Some(profile.clone());
                context.pregnancy_week = profile.current_week_of_pregnancy;
                updated += 1;
            }
        }
        if updated > 0 {
            self.store_all(&contexts).await?;
        }
        info!(conversations = updated, "updated user profile");
        Ok(updated)
    }

    /// Set or clear the per-conversation system prompt override.
    pub async fn set_system_prompt(
        &self,
        id: &ConversationId,
        prompt: Option<String>,
    ) -> Result<ConversationContext, ContextError> {
        let _guard = self.lock.lock().await;
        let mut contexts = self.load_all().await?;
        let context = contexts
            .get_mut(id)
            .ok_or_else(|| ContextError::NotFound(id.clone()))?;
        context.system_prompt = prompt;
        let updated = context.clone();
        self.store_all(&contexts).await?;
        Ok(updated)
    }

    pub fn get_system_prompt(&self, context: &ConversationContext) -> String {
        prompt::system_prompt(context, &self.base_prompt)
    }

    pub fn convert_to_api_messages(&self, context: &ConversationContext) -> Vec<ApiMessage> {
        prompt::convert_to_api_messages(context, &self.base_prompt)
    }
}
