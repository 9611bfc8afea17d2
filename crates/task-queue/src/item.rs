//! Queued work items.
//!
//! Producers implement [`Task`]. The queue wraps every enqueued task in a
//! [`QueueItem`] that owns the lifecycle: the status only moves
//! `Pending -> Running -> Finished`, and only the queue moves it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::priority::Priority;

/// Lifecycle status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting in the queue.
    Pending,
    /// Dispatched; `execute` is running on a worker.
    Running,
    /// Worker terminated and `finish` has been called.
    Finished,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Running => write!(f, "running"),
            ItemStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Context handed to [`Task::execute`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Id assigned to the item at enqueue.
    pub item_id: u64,
    /// Derived worker name (`<QUEUE>-<THREAD-NAME>`).
    pub worker_name: String,
    /// Cancelled when the item is cancelled or the queue shuts down.
    pub cancellation_token: CancellationToken,
}

impl TaskContext {
    /// Check if this task has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Resolves once this task has been asked to stop.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}

/// A unit of deferred work.
///
/// # Contract
///
/// - `execute` must terminate eventually. It runs on its own Tokio task, so a
///   panic is contained and treated like a normal return.
/// - `finish` is called exactly once per dispatched item, after the worker has
///   terminated, whatever the outcome of `execute`. Record failures on the
///   task itself; the queue does not look at them.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Human-readable label. Not required to be unique.
    fn name(&self) -> &str;

    /// Admission priority, read once at enqueue.
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Explicit worker name; defaults to the sanitized [`name`](Task::name).
    fn thread_name(&self) -> Option<&str> {
        None
    }

    /// Producer-defined action classification, read once at enqueue.
    fn action_id(&self) -> u32 {
        0
    }

    /// Task body.
    async fn execute(&self, ctx: TaskContext);

    /// Cleanup after the worker terminated.
    ///
    /// Runs on the thread that reconciled the item, while the queue's tick
    /// lock is held. Enqueueing follow-up work is fine; calling
    /// [`TaskQueue::tick`](crate::TaskQueue::tick) or
    /// [`TaskQueue::reconcile`](crate::TaskQueue::reconcile) from here is a
    /// no-op, and the next tick picks the follow-up up.
    fn finish(&self) {}
}

#[async_trait]
impl<T: Task + ?Sized> Task for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn priority(&self) -> Priority {
        (**self).priority()
    }

    fn thread_name(&self) -> Option<&str> {
        (**self).thread_name()
    }

    fn action_id(&self) -> u32 {
        (**self).action_id()
    }

    async fn execute(&self, ctx: TaskContext) {
        (**self).execute(ctx).await
    }

    fn finish(&self) {
        (**self).finish()
    }
}

/// Default worker name for a task label: whitespace becomes `-`, letters are
/// upper-cased.
pub fn default_thread_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect::<String>()
        .to_uppercase()
}

pub(crate) fn worker_name(queue_name: &str, task: &dyn Task) -> String {
    match task.thread_name() {
        Some(thread_name) => format!("{}-{}", queue_name, thread_name),
        None => format!("{}-{}", queue_name, default_thread_name(task.name())),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ItemTimes {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// An enqueued task plus the lifecycle the queue tracks for it.
pub(crate) struct QueueItem {
    id: u64,
    name: String,
    priority: Priority,
    action_id: u32,
    enqueued_at: DateTime<Utc>,
    task: Box<dyn Task>,
    status: watch::Sender<ItemStatus>,
    times: parking_lot::Mutex<ItemTimes>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("status", &*self.status.borrow())
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

impl QueueItem {
    pub(crate) fn new(
        id: u64,
        task: Box<dyn Task>,
        enqueued_at: DateTime<Utc>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(ItemStatus::Pending);
        Self {
            id,
            name: task.name().to_string(),
            priority: task.priority(),
            action_id: task.action_id(),
            enqueued_at,
            task,
            status,
            times: parking_lot::Mutex::new(ItemTimes::default()),
            cancellation_token,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn action_id(&self) -> u32 {
        self.action_id
    }

    pub(crate) fn task(&self) -> &dyn Task {
        self.task.as_ref()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// `Pending -> Running`. Returns `false` if the item was not pending.
    pub(crate) fn mark_running(&self) -> bool {
        let mut times = self.times.lock();
        let moved = self.status.send_if_modified(|status| {
            if *status == ItemStatus::Pending {
                *status = ItemStatus::Running;
                true
            } else {
                false
            }
        });
        if moved {
            times.started_at = Some(Utc::now());
        }
        moved
    }

    /// `Running -> Finished`. Returns `false` if the item was not running.
    pub(crate) fn mark_finished(&self) -> bool {
        // Held across the transition: waiters never see Finished without a time.
        let mut times = self.times.lock();
        let moved = self.status.send_if_modified(|status| {
            if *status == ItemStatus::Running {
                *status = ItemStatus::Finished;
                true
            } else {
                false
            }
        });
        if moved {
            times.finished_at = Some(Utc::now());
        }
        moved
    }
}

/// Shared handle to an enqueued item.
#[derive(Debug, Clone)]
pub struct ItemHandle(pub(crate) Arc<QueueItem>);

impl ItemHandle {
    /// Id assigned at enqueue, unique within the queue.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn priority(&self) -> Priority {
        self.0.priority
    }

    pub fn action_id(&self) -> u32 {
        self.0.action_id
    }

    /// When the item was accepted by the queue.
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.0.enqueued_at
    }

    pub fn status(&self) -> ItemStatus {
        *self.0.status.borrow()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.0.times.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.0.times.lock().finished_at
    }

    /// Check if this item has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancellation_token.is_cancelled()
    }

    /// Wait until the item reaches [`ItemStatus::Finished`].
    pub async fn wait_finished(&self) {
        let mut rx = self.0.status.subscribe();
        // The sender lives inside the item we hold, so this cannot fail.
        let _ = rx.wait_for(|status| *status == ItemStatus::Finished).await;
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> ItemSnapshot {
        let times = *self.0.times.lock();
        ItemSnapshot {
            id: self.0.id,
            name: self.0.name.clone(),
            priority: self.0.priority,
            action_id: self.0.action_id,
            status: self.status(),
            enqueued_at: self.0.enqueued_at,
            started_at: times.started_at,
            finished_at: times.finished_at,
        }
    }
}

/// Serializable view of a queued item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: u64,
    pub name: String,
    pub priority: Priority,
    pub action_id: u32,
    pub status: ItemStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
