//! Completion endpoint integration.
//!
//! The queue talks to the model through the [`CompletionClient`] trait. The
//! shipped backend is [`OpenAiClient`], which targets the OpenAI Chat
//! Completions API and any endpoint that mimics it.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐
//! │ RequestQueue │────▶│ CompletionClient │  (trait)
//! └──────────────┘     └────────┬─────────┘
//!                               │
//!                 ┌─────────────┴─────────────┐
//!                 ▼                           ▼
//!         ┌──────────────┐           ┌────────────────┐
//!         │ OpenAiClient │           │ scripted fakes │
//!         │ (HTTP JSON)  │           │ (tests)        │
//!         └──────────────┘           └────────────────┘
//! ```

pub mod client;
pub mod openai;
pub mod types;

use std::sync::Arc;

pub use client::{CompletionClient, CompletionError, ErrorKind};
pub use openai::OpenAiClient;
pub use types::*;

use crate::credentials::CredentialStore;

/// Create the completion client described by the `[completion]` config section.
pub fn create_client(
    config: &nurture_config::CompletionConfig,
    credentials: Arc<dyn CredentialStore>,
) -> Arc<dyn CompletionClient> {
    let client = OpenAiClient::new(credentials)
        .with_base_url(&config.base_url)
        .with_model(&config.model)
        .with_temperature(config.temperature);
    Arc::new(client)
}
