//! Queued task data and the outcomes the consumer emits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::completion::{CompletionError, CompletionRequest, CompletionResponse};
use crate::message::{ConversationId, MessageId, string_id};

string_id!(
    /// Identifies one queued task.
    TaskId
);

/// Service class of a task. Lower rank is served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!(
                "unknown priority '{other}' (expected high, normal or low)"
            )),
        }
    }
}

/// One pending completion, as persisted under the queue key.
///
/// Carries only data. The outcome is routed back to the placeholder
/// identified by `conversation_id` + `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: TaskId,
    pub conversation_id: ConversationId,
    /// The assistant placeholder this task fills.
    pub message_id: MessageId,
    pub request: CompletionRequest,
    #[serde(default)]
    pub priority: Priority,
    /// Arrival time in epoch millis; breaks ties within a priority.
    pub enqueued_at: u64,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedTask {
    pub fn new(
        conversation_id: ConversationId,
        message_id: MessageId,
        request: CompletionRequest,
        priority: Priority,
        enqueued_at: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            conversation_id,
            message_id,
            request,
            priority,
            enqueued_at,
            retry_count: 0,
            max_retries,
        }
    }

    /// Service order key: priority rank, then arrival.
    pub fn order_key(&self) -> (u8, u64) {
        (self.priority.rank(), self.enqueued_at)
    }
}

/// Final result of a task, emitted exactly once per dequeued task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    /// Attempts made, including the first.
    pub attempts: u32,
    pub result: Result<CompletionResponse, CompletionError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
