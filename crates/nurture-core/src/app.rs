//! Application context: builds every component once and shares the handles.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use nurture_config::{AppConfig, ConfigError};

use crate::clock::{Clock, SystemClock};
use crate::completion::{self, CompletionClient};
use crate::context::ContextManager;
use crate::credentials::{CredentialStore, FileCredentials};
use crate::dispatch::{DispatchError, DispatchSettings, Dispatcher};
use crate::queue::RequestQueue;
use crate::rate_limit::RateLimiter;
use crate::storage::{FileStore, KvStore, StorageError};

/// File under the data directory holding the API key.
pub const CREDENTIALS_FILE: &str = "api_key";

/// Errors from building the application context.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The process-wide set of dispatch components.
pub struct App {
    config: AppConfig,
    store: Arc<dyn KvStore>,
    contexts: Arc<ContextManager>,
    limiter: Arc<RateLimiter>,
    queue: RequestQueue,
    dispatcher: Dispatcher,
}

impl App {
    /// Assemble the components over the given collaborators.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        client: Arc<dyn CompletionClient>,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let contexts = Arc::new(ContextManager::new(
            &config.context,
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let (queue, outcomes) = RequestQueue::new(&config.queue, Arc::clone(&store), client);
        let dispatcher = Dispatcher::new(
            DispatchSettings::from_config(&config),
            Arc::clone(&contexts),
            Arc::clone(&limiter),
            queue.clone(),
            outcomes,
            credentials,
            clock,
        );

        Self {
            config,
            store,
            contexts,
            limiter,
            queue,
            dispatcher,
        }
    }

    /// Production wiring: file storage under `storage.data_dir`, the key file
    /// beside it (or the configured environment variable), the OpenAI client
    /// and the system clock.
    pub async fn from_config(config: AppConfig) -> Result<Self, AppError> {
        config.validate()?;
        let data_dir = PathBuf::from(&config.storage.data_dir);
        let store: Arc<dyn KvStore> = Arc::new(FileStore::open(data_dir.clone()).await?);
        let credentials: Arc<dyn CredentialStore> = Arc::new(
            FileCredentials::new(data_dir.join(CREDENTIALS_FILE))
                .with_env_fallback(&config.completion.api_key_env),
        );
        let client = completion::create_client(&config.completion, Arc::clone(&credentials));

        info!(
            data_dir = %data_dir.display(),
            model = %config.completion.model,
            backend = client.name(),
            "application context ready"
        );
        Ok(Self::new(
            config,
            store,
            client,
            credentials,
            Arc::new(SystemClock),
        ))
    }

    /// Resume the persisted queue. Returns whether an API key is available.
    pub async fn start(&self) -> Result<bool, DispatchError> {
        self.dispatcher.initialize().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Resolve once every queued task has finished and its outcome landed.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_from_config_creates_data_dir() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("state");
        let mut config = AppConfig::default();
        config.storage.data_dir = data_dir.to_string_lossy().into_owned();
        config.completion.api_key_env = "NURTURE_TEST_UNSET_KEY_VAR".to_string();

        let app = App::from_config(config).await.unwrap();
        assert!(data_dir.is_dir());
        assert_eq!(app.queue().get_queue_length(), 0);
        assert!(!app.start().await.unwrap());
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.context.max_history = 0;
        assert!(matches!(
            App::from_config(config).await,
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_lifecycle_through_dispatcher() {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = tmp.path().to_string_lossy().into_owned();
        config.completion.api_key_env = "NURTURE_TEST_UNSET_KEY_VAR".to_string();
        let app = App::from_config(config).await.unwrap();

        let dispatcher = app.dispatcher();
        assert!(!dispatcher.has_api_key().await.unwrap());
        dispatcher.set_api_key("  sk-test  ").await.unwrap();
        assert!(dispatcher.has_api_key().await.unwrap());
        assert!(tmp.path().join(CREDENTIALS_FILE).exists());
        dispatcher.clear_api_key().await.unwrap();
        assert!(!dispatcher.has_api_key().await.unwrap());
    }
}
