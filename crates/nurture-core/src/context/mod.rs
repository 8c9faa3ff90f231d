//! Conversation contexts: bounded history, profile snapshot and prompt rendering.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               ContextManager               │
//! │                                            │
//! │  ai_context ──▶ { conversation id ──▶      │
//! │                   ConversationContext }    │
//! │                                            │
//! │  append ─▶ truncate to last N ─▶ persist   │
//! │                                            │
//! │  prompt: system prompt + user/assistant    │
//! └────────────────────────────────────────────┘
//! ```
//!
//! All contexts live in one persisted map. Every mutation takes the
//! conversation id explicitly; there is no lookup by message id across
//! conversations.

pub mod manager;
pub mod prompt;

pub use manager::{CONTEXT_STORAGE_KEY, ContextError, ContextManager, ConversationContext};
pub use prompt::{convert_to_api_messages, system_prompt};
