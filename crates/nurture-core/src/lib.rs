#![deny(unsafe_code)]

//! Nurture completion dispatch core.
//!
//! Sits between conversation state and an external chat-completion endpoint:
//! a durable, priority-ordered request queue drained by a single consumer,
//! rolling-window rate limits, exponential backoff with jitter, and bounded
//! per-conversation context windows. [`App`] wires the components together;
//! [`Dispatcher`] is the entry point for a user turn.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, returned by the async methods
/// of traits used as `dyn Trait` (`KvStore`, `CredentialStore`,
/// `CompletionClient`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Composition root.
pub mod app;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Wall-clock abstraction.
pub mod clock;
/// Completion client trait, wire types and the OpenAI backend.
pub mod completion;
/// Conversation contexts and prompt rendering.
pub mod context;
/// API key storage with zeroization.
pub mod credentials;
/// User-turn orchestration and outcome application.
pub mod dispatch;
/// Chat message and profile types.
pub mod message;
/// Durable priority queue with retry and backoff.
pub mod queue;
/// Rolling-window admission limits.
pub mod rate_limit;
/// Durable key/value storage.
pub mod storage;

pub use app::{App, AppError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{CompletionClient, CompletionError, ErrorKind, OpenAiClient};
pub use context::{ContextError, ContextManager, ConversationContext};
pub use credentials::{ApiKey, CredentialError, CredentialStore, FileCredentials, MemoryCredentials};
pub use dispatch::{DispatchError, Dispatcher, SendOptions, SentMessage};
pub use message::{ChatMessage, ConversationId, MessageId, Role, UserProfile};
pub use queue::{Priority, QueueError, QueuedTask, RequestQueue, TaskOutcome};
pub use rate_limit::{RateLimitState, RateLimiter, RemainingQuota};
pub use storage::{FileStore, KvStore, MemoryStore, StorageError};
