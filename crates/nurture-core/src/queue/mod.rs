//! Durable, priority-ordered completion queue with a single consumer.
//!
//! ```text
//!  enqueue ──▶ [ sort by (rank, arrival) ] ──▶ persist ──▶ wake consumer
//!                                                            │
//!             ┌──────────────────────────────────────────────┘
//!             ▼
//!      ┌─────────────┐  ok            remove, persist, emit success
//!      │ attempt head│──────────────▶
//!      └─────┬───────┘  retryable     retry_count += 1, persist, sleep
//!            │          & budget left
//!            └────────▶ otherwise     remove, persist, emit failure
//! ```
//!
//! The whole list is written under [`QUEUE_STORAGE_KEY`] after every
//! mutation. After a restart [`RequestQueue::initialize`] reloads it and the
//! former head is attempted again. A task becomes visible to the consumer
//! only once the write that adds it has succeeded.
//!
//! Outcomes leave the queue as [`TaskOutcome`] values on an mpsc channel.

pub mod backoff;
pub mod task;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use nurture_config::QueueConfig;

use crate::completion::{CompletionClient, CompletionError, CompletionResponse};
use crate::storage::{KvStore, StorageError, load_json_or_discard, save_json};

pub use backoff::BackoffPolicy;
pub use task::{Priority, QueuedTask, TaskId, TaskOutcome};

/// Storage key of the persisted task list.
pub const QUEUE_STORAGE_KEY: &str = "ai_message_queue";

/// Capacity of the outcome channel.
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to persist queue: {0}")]
    Storage(#[from] StorageError),
}

/// Handle to the queue. Cheap to clone; all clones share one consumer.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    /// Sorted task list. Never held across an await.
    tasks: Mutex<Vec<QueuedTask>>,
    /// Serializes writes; each write snapshots `tasks` after acquiring it.
    persist_lock: tokio::sync::Mutex<()>,
    /// Enqueued ids whose write has not succeeded yet. The consumer skips
    /// them. Lock after `tasks` when both are held.
    uncommitted: Mutex<HashSet<TaskId>>,
    store: Arc<dyn KvStore>,
    client: Arc<dyn CompletionClient>,
    backoff: BackoffPolicy,
    outcomes: mpsc::Sender<TaskOutcome>,
    outcomes_sent: AtomicU64,
    /// `true` while a consumer task is running.
    busy: watch::Sender<bool>,
}

impl RequestQueue {
    /// Create an empty queue and the receiving end of its outcome channel.
    pub fn new(
        config: &QueueConfig,
        store: Arc<dyn KvStore>,
        client: Arc<dyn CompletionClient>,
    ) -> (Self, mpsc::Receiver<TaskOutcome>) {
        Self::with_backoff(BackoffPolicy::from_config(config), store, client)
    }

    pub fn with_backoff(
        backoff: BackoffPolicy,
        store: Arc<dyn KvStore>,
        client: Arc<dyn CompletionClient>,
    ) -> (Self, mpsc::Receiver<TaskOutcome>) {
        let (outcomes, outcome_rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let (busy, _) = watch::channel(false);
        let inner = QueueInner {
            tasks: Mutex::new(Vec::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            uncommitted: Mutex::new(HashSet::new()),
            store,
            client,
            backoff,
            outcomes,
            outcomes_sent: AtomicU64::new(0),
            busy,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            outcome_rx,
        )
    }

    /// Reload the persisted queue and resume processing.
    ///
    /// Persisted tasks not already held in memory are merged in. Returns the
    /// number of tasks pending afterwards.
    pub async fn initialize(&self) -> Result<usize, QueueError> {
        let persisted = self.load_persisted().await?;

        let pending = {
            let mut tasks = self.inner.lock_tasks();
            for task in persisted {
                if !tasks.iter().any(|t| t.id == task.id) {
                    tasks.push(task);
                }
            }
            tasks.sort_by_key(QueuedTask::order_key);
            tasks.len()
        };

        if pending > 0 {
            info!(pending, "resuming persisted queue");
            self.inner.persist().await?;
            self.ensure_running();
        }
        Ok(pending)
    }

    /// Add a task and start the consumer if it is idle.
    ///
    /// Returns once the sorted queue is persisted. If persisting fails the
    /// task is withdrawn and the error returned; the consumer never attempts
    /// a task before its write has succeeded.
    pub async fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError> {
        let task_id = task.id.clone();
        let priority = task.priority;
        let len = {
            let mut tasks = self.inner.lock_tasks();
            tasks.push(task);
            tasks.sort_by_key(QueuedTask::order_key);
            self.inner.lock_uncommitted().insert(task_id.clone());
            tasks.len()
        };

        if let Err(e) = self.inner.persist().await {
            self.inner.remove(&task_id);
            self.inner.lock_uncommitted().remove(&task_id);
            error!(task = %task_id, error = %e, "failed to persist enqueued task, withdrawn");
            return Err(e.into());
        }
        self.inner.lock_uncommitted().remove(&task_id);

        debug!(task = %task_id, %priority, queue_len = len, "task enqueued");
        self.ensure_running();
        Ok(())
    }

    /// Drop every pending task. An in-flight attempt still completes and
    /// emits its outcome.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let dropped = {
            let mut tasks = self.inner.lock_tasks();
            let n = tasks.len();
            tasks.clear();
            n
        };
        self.inner.persist().await?;
        info!(dropped, "queue cleared");
        Ok(dropped)
    }

    /// Tasks as currently persisted, without touching the in-memory queue.
    pub async fn load_persisted(&self) -> Result<Vec<QueuedTask>, QueueError> {
        let tasks = load_json_or_discard::<Vec<QueuedTask>>(
            self.inner.store.as_ref(),
            QUEUE_STORAGE_KEY,
        )
        .await?
        .unwrap_or_default();
        Ok(tasks)
    }

    pub fn get_queue_length(&self) -> usize {
        self.inner.lock_tasks().len()
    }

    /// Snapshot of pending tasks in service order.
    pub fn pending(&self) -> Vec<QueuedTask> {
        self.inner.lock_tasks().clone()
    }

    pub fn is_processing(&self) -> bool {
        *self.inner.busy.borrow()
    }

    /// Outcomes emitted so far.
    pub fn outcomes_sent(&self) -> u64 {
        self.inner.outcomes_sent.load(Ordering::SeqCst)
    }

    /// Resolve once the consumer has drained the queue and gone idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.busy.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    fn ensure_running(&self) {
        let started = self.inner.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if started {
            debug!("starting queue consumer");
            tokio::spawn(Arc::clone(&self.inner).run());
        }
    }
}

impl QueueInner {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<QueuedTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_uncommitted(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.uncommitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: &TaskId) -> bool {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|t| t.id != *id);
        tasks.len() != before
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.lock_tasks().clone();
        save_json(self.store.as_ref(), QUEUE_STORAGE_KEY, &snapshot).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "failed to persist queue");
        }
    }

    /// First committed task, or `None` after marking the consumer idle.
    ///
    /// The check and the idle transition happen under the tasks lock, so an
    /// enqueue that commits afterwards finds the consumer idle and restarts it.
    fn next_or_idle(&self) -> Option<QueuedTask> {
        let tasks = self.lock_tasks();
        let uncommitted = self.lock_uncommitted();
        match tasks.iter().find(|t| !uncommitted.contains(&t.id)) {
            Some(task) => Some(task.clone()),
            None => {
                self.busy.send_replace(false);
                None
            }
        }
    }

    async fn run(self: Arc<Self>) {
        while let Some(task) = self.next_or_idle() {
            self.process(task).await;
        }
        debug!("queue consumer idle");
    }

    async fn process(&self, task: QueuedTask) {
        let attempt = task.retry_count + 1;
        debug!(task = %task.id, attempt, priority = %task.priority, "attempting completion");

        let err = match self.attempt(&task).await {
            Ok(response) => {
                self.remove(&task.id);
                self.persist_logged().await;
                info!(task = %task.id, attempts = attempt, "completion succeeded");
                self.emit(task, attempt, Ok(response)).await;
                return;
            }
            Err(err) => err,
        };

        if err.is_retryable() && task.retry_count < task.max_retries {
            let retry_count = {
                let mut tasks = self.lock_tasks();
                tasks.iter_mut().find(|t| t.id == task.id).map(|t| {
                    t.retry_count += 1;
                    t.retry_count
                })
            };

            if let Some(retry_count) = retry_count {
                let delay = self.backoff.delay_for(retry_count, &err);
                warn!(
                    task = %task.id,
                    error = %err,
                    retry = retry_count,
                    max_retries = task.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "completion failed, retrying"
                );
                self.persist_logged().await;
                tokio::time::sleep(delay).await;
                return;
            }
            debug!(task = %task.id, "task cleared while in flight, not retrying");
        }

        self.remove(&task.id);
        self.persist_logged().await;
        warn!(
            task = %task.id,
            kind = ?err.kind(),
            error = %err,
            attempts = attempt,
            "completion failed"
        );
        self.emit(task, attempt, Err(err)).await;
    }

    async fn attempt(&self, task: &QueuedTask) -> Result<CompletionResponse, CompletionError> {
        let call = self.client.complete(&task.request);
        match task.request.options.timeout_ms.filter(|ms| *ms > 0) {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                .await
                .unwrap_or(Err(CompletionError::Timeout)),
            None => call.await,
        }
    }

    async fn emit(
        &self,
        task: QueuedTask,
        attempts: u32,
        result: Result<CompletionResponse, CompletionError>,
    ) {
        let outcome = TaskOutcome {
            task_id: task.id,
            conversation_id: task.conversation_id,
            message_id: task.message_id,
            attempts,
            result,
        };
        self.outcomes_sent.fetch_add(1, Ordering::SeqCst);
        if self.outcomes.send(outcome).await.is_err() {
            self.outcomes_sent.fetch_sub(1, Ordering::SeqCst);
            warn!("outcome receiver dropped, discarding outcome");
        }
    }
}
