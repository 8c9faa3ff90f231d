//! [`App`] test harness.
//!
//! Builds an application context over in-memory storage, a
//! [`ScriptedClient`], a [`ManualClock`] and a pre-loaded API key.

use std::sync::Arc;

use nurture_config::AppConfig;
use nurture_core::{
    App, ChatMessage, Clock, CompletionClient, ConversationContext, ConversationId,
    CredentialStore, Dispatcher, KvStore, ManualClock, MemoryCredentials, MemoryStore, MessageId,
};

use crate::config::TestConfigBuilder;
use crate::fixtures::ScriptedClient;

/// A test-scoped application with handles to every fake collaborator.
pub struct TestApp {
    pub app: App,
    pub store: Arc<MemoryStore>,
    pub client: Arc<ScriptedClient>,
    pub clock: Arc<ManualClock>,
    pub credentials: Arc<MemoryCredentials>,
}

impl TestApp {
    /// Default test config over fresh storage.
    pub fn new(client: ScriptedClient) -> Self {
        Self::with_config(TestConfigBuilder::new().build(), client)
    }

    pub fn with_config(config: AppConfig, client: ScriptedClient) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), Arc::new(client))
    }

    /// Build over existing storage, e.g. to simulate a restart.
    pub fn with_store(
        config: AppConfig,
        store: Arc<MemoryStore>,
        client: Arc<ScriptedClient>,
    ) -> Self {
        let clock = Arc::new(ManualClock::default());
        let credentials = Arc::new(MemoryCredentials::with_key("test-key"));
        let kv: Arc<dyn KvStore> = store.clone();
        let completion: Arc<dyn CompletionClient> = client.clone();
        let keys: Arc<dyn CredentialStore> = credentials.clone();
        let time: Arc<dyn Clock> = clock.clone();
        let app = App::new(config, kv, completion, keys, time);
        Self {
            app,
            store,
            client,
            clock,
            credentials,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.app.dispatcher()
    }

    /// Wait for the queue to drain and every outcome to be applied.
    pub async fn settle(&self) {
        self.app.wait_idle().await;
    }

    /// The persisted conversation; panics if it does not exist.
    pub async fn conversation(&self, id: &ConversationId) -> ConversationContext {
        self.app
            .contexts()
            .get_context(id)
            .await
            .expect("context storage failed")
            .unwrap_or_else(|| panic!("conversation {id} not found"))
    }

    /// A persisted message, if it is still in the history window.
    pub async fn message(&self, conversation: &ConversationId, id: &MessageId) -> Option<ChatMessage> {
        self.app
            .contexts()
            .get_context(conversation)
            .await
            .expect("context storage failed")?
            .message_history
            .into_iter()
            .find(|m| m.id == *id)
    }
}
