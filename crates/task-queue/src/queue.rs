//! Single-flight task queue.
//!
//! Items wait in strict FIFO order. Each [`TaskQueue::tick`] first reconciles
//! the previously dispatched item (finalizing it once its worker has
//! terminated), then checks the head item against the admission floor and, if
//! admitted, starts it on a Tokio task. At most one item runs at a time.
//!
//! Priority never reorders the queue: an inadmissible head item blocks
//! everything behind it until the floor drops or the queue is unpaused.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::item::{ItemHandle, ItemSnapshot, QueueItem, Task, TaskContext, worker_name};
use crate::priority::Priority;

/// Result of a single [`TaskQueue::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The current worker is still running.
    Busy,
    /// Nothing is pending.
    Idle,
    /// The head item is held back by pause or the priority floor.
    Deferred,
    /// The queue was shut down; nothing will be dispatched.
    ShutDown,
    /// The head item was promoted and its worker started.
    Dispatched { id: u64, worker_name: String },
}

impl TickOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, TickOutcome::Dispatched { .. })
    }
}

/// Serializable queue status for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub pending: usize,
    pub paused: bool,
    pub min_priority: Option<Priority>,
    pub shut_down: bool,
    pub current: Option<ItemSnapshot>,
}

/// Completion flag set by the worker itself.
#[derive(Debug, Default)]
pub(crate) struct CompletionSignal {
    done: AtomicBool,
    panicked: AtomicBool,
    notify: Notify,
}

impl CompletionSignal {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Wait until the worker has signalled completion.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

/// Moved into the worker future; fires when the future completes or is
/// dropped without completing (abort, runtime shutdown).
struct CompletionGuard {
    signal: Arc<CompletionSignal>,
    wakeup: Arc<Notify>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.signal.done.store(true, Ordering::Release);
        self.signal.notify.notify_waiters();
        self.wakeup.notify_one();
    }
}

/// The item occupying the single execution slot.
struct Running {
    item: Arc<QueueItem>,
    worker_name: String,
    handle: JoinHandle<()>,
    signal: Arc<CompletionSignal>,
}

impl Running {
    fn has_terminated(&self) -> bool {
        self.signal.is_done() || self.handle.is_finished()
    }
}

struct QueueState {
    pending: VecDeque<Arc<QueueItem>>,
    current: Option<Running>,
    min_priority: Option<Priority>,
    paused: bool,
    shut_down: bool,
    next_id: u64,
    last_enqueued_at: Option<DateTime<Utc>>,
}

enum Reconcile {
    Idle,
    Busy,
    Finalized,
}

/// Single-flight priority work queue.
///
/// Share it as `Arc<TaskQueue>` between producers and the driver.
pub struct TaskQueue {
    name: String,
    state: Mutex<QueueState>,
    /// Serializes `tick`/`reconcile` bookkeeping. The flag is set while a
    /// task's `finish` runs, so calls made from inside `finish` return
    /// early instead of finalizing or dispatching.
    tick_lock: ReentrantMutex<Cell<bool>>,
    /// Runtime captured at construction, used when `tick` is called from a
    /// thread outside any runtime.
    runtime: Option<Handle>,
    /// Woken on enqueue and on worker completion.
    wakeup: Arc<Notify>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl TaskQueue {
    /// Create a queue with the default configuration and the given name.
    ///
    /// When called inside a Tokio runtime, that runtime runs the workers
    /// even if `tick` is later called from a plain thread.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), None, false)
    }

    /// Create a queue from a validated configuration.
    pub fn with_config(config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            config.name.clone(),
            config.min_priority,
            config.start_paused,
        ))
    }

    fn from_parts(name: String, min_priority: Option<Priority>, paused: bool) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                min_priority,
                paused,
                shut_down: false,
                next_id: 0,
                last_enqueued_at: None,
            }),
            tick_lock: ReentrantMutex::new(Cell::new(false)),
            runtime: Handle::try_current().ok(),
            wakeup: Arc::new(Notify::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Queue name, used as the worker-name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task to the queue.
    ///
    /// No admission check happens here. Fails only once the queue has been
    /// shut down.
    pub fn enqueue<T: Task>(&self, task: T) -> Result<ItemHandle> {
        let task: Box<dyn Task> = Box::new(task);

        let handle = {
            let mut state = self.state.lock();
            if state.shut_down {
                error!(queue = %self.name, task = %task.name(), "Enqueue rejected: queue is shut down");
                return Err(QueueError::ShutDown(self.name.clone()));
            }

            // Keep stamps non-decreasing even if the wall clock steps back.
            let now = Utc::now();
            let enqueued_at = match state.last_enqueued_at {
                Some(last) if last > now => last,
                _ => now,
            };
            state.last_enqueued_at = Some(enqueued_at);
            state.next_id += 1;

            let item = Arc::new(QueueItem::new(
                state.next_id,
                task,
                enqueued_at,
                self.cancellation_token.child_token(),
            ));
            state.pending.push_back(item.clone());
            ItemHandle(item)
        };

        debug!(
            queue = %self.name,
            id = handle.id(),
            task = %handle.name(),
            priority = %handle.priority(),
            "Enqueued task"
        );
        self.wakeup.notify_one();
        Ok(handle)
    }

    /// Reconcile the previous run, then dispatch the head item if admitted.
    ///
    /// Never waits for a worker. Safe to call concurrently; calls are
    /// serialized. Dispatching needs a Tokio runtime: the one the queue was
    /// created in, or else the caller's.
    ///
    /// Called from inside a task's `finish`, returns [`TickOutcome::Busy`]
    /// without doing anything.
    pub fn tick(&self) -> Result<TickOutcome> {
        let finalizing = self.tick_lock.lock();
        if finalizing.get() {
            debug!(queue = %self.name, "Tick called from finish, skipping");
            return Ok(TickOutcome::Busy);
        }

        if let Reconcile::Busy = self.reconcile_locked(&finalizing) {
            return Ok(TickOutcome::Busy);
        }
        self.dispatch_locked()
    }

    /// Finalize the current item if its worker has terminated.
    ///
    /// Returns `true` if an item was finalized. Always `false` when called
    /// from inside a task's `finish`.
    pub fn reconcile(&self) -> bool {
        let finalizing = self.tick_lock.lock();
        if finalizing.get() {
            return false;
        }
        matches!(self.reconcile_locked(&finalizing), Reconcile::Finalized)
    }

    fn reconcile_locked(&self, finalizing: &Cell<bool>) -> Reconcile {
        let running = {
            let mut state = self.state.lock();
            match state.current.as_ref() {
                None => return Reconcile::Idle,
                Some(running) if !running.has_terminated() => return Reconcile::Busy,
                Some(_) => state.current.take(),
            }
        };

        if let Some(running) = running {
            finalizing.set(true);
            self.finalize(running);
            finalizing.set(false);
        }
        Reconcile::Finalized
    }

    /// Runs `finish` outside the state lock so it may enqueue follow-up work.
    fn finalize(&self, running: Running) {
        let Running {
            item,
            worker_name,
            signal,
            ..
        } = running;

        if signal.panicked() {
            warn!(queue = %self.name, worker = %worker_name, id = item.id(), "Worker panicked");
        } else if !signal.is_done() {
            warn!(queue = %self.name, worker = %worker_name, id = item.id(), "Worker terminated without signalling completion");
        }

        let task = item.task();
        if std::panic::catch_unwind(AssertUnwindSafe(|| task.finish())).is_err() {
            error!(queue = %self.name, worker = %worker_name, id = item.id(), "Task finish panicked");
        }
        item.mark_finished();

        info!(queue = %self.name, worker = %worker_name, id = item.id(), "Finished task");
    }

    fn dispatch_locked(&self) -> Result<TickOutcome> {
        let mut state = self.state.lock();

        if state.shut_down {
            return Ok(TickOutcome::ShutDown);
        }
        let Some(head) = state.pending.front() else {
            return Ok(TickOutcome::Idle);
        };
        if state.paused {
            trace!(queue = %self.name, id = head.id(), "Queue paused, deferring head item");
            return Ok(TickOutcome::Deferred);
        }
        if !head.priority().meets(state.min_priority) {
            trace!(
                queue = %self.name,
                id = head.id(),
                priority = %head.priority(),
                "Head item below admission floor, deferring"
            );
            return Ok(TickOutcome::Deferred);
        }

        let runtime = match &self.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|_| QueueError::NoRuntime)?,
        };
        let Some(item) = state.pending.pop_front() else {
            return Ok(TickOutcome::Idle);
        };

        let worker_name = worker_name(&self.name, item.task());
        item.mark_running();

        let signal = Arc::new(CompletionSignal::default());
        let guard = CompletionGuard {
            signal: signal.clone(),
            wakeup: self.wakeup.clone(),
        };
        let ctx = TaskContext {
            item_id: item.id(),
            worker_name: worker_name.clone(),
            cancellation_token: item.cancellation_token().clone(),
        };
        let span = info_span!("worker", worker = %worker_name, id = item.id());
        let worker_item = item.clone();

        let handle = runtime.spawn(
            async move {
                let guard = guard;
                let outcome = AssertUnwindSafe(worker_item.task().execute(ctx))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    guard.signal.panicked.store(true, Ordering::Release);
                }
            }
            .instrument(span),
        );

        info!(
            queue = %self.name,
            worker = %worker_name,
            id = item.id(),
            priority = %item.priority(),
            "Dispatched task"
        );

        let id = item.id();
        state.current = Some(Running {
            item,
            worker_name: worker_name.clone(),
            handle,
            signal,
        });

        Ok(TickOutcome::Dispatched { id, worker_name })
    }

    /// Wait until the current worker (if any) has terminated.
    ///
    /// Does not finalize it; call [`reconcile`](Self::reconcile) or
    /// [`tick`](Self::tick) afterwards.
    pub async fn wait_current(&self) {
        let signal = self
            .state
            .lock()
            .current
            .as_ref()
            .map(|running| running.signal.clone());

        if let Some(signal) = signal {
            signal.wait().await;
        }
    }

    /// Stop admitting work. In-flight work is not affected.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        info!(queue = %self.name, "Pausing queue");
    }

    /// Resume admitting work.
    pub fn unpause(&self) {
        self.state.lock().paused = false;
        info!(queue = %self.name, "Unpausing queue");
        self.wakeup.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Set the admission floor. `None` admits every priority.
    pub fn set_min_priority(&self, min_priority: Option<Priority>) {
        self.state.lock().min_priority = min_priority;
        match min_priority {
            Some(priority) => info!(queue = %self.name, floor = %priority, "Admission floor set"),
            None => info!(queue = %self.name, "Admission floor cleared"),
        }
        self.wakeup.notify_one();
    }

    pub fn min_priority(&self) -> Option<Priority> {
        self.state.lock().min_priority
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Whether an item occupies the execution slot.
    pub fn is_busy(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// The item occupying the execution slot.
    pub fn current(&self) -> Option<ItemSnapshot> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|running| ItemHandle(running.item.clone()).snapshot())
    }

    /// Pending items in dispatch order.
    pub fn pending_items(&self) -> Vec<ItemSnapshot> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|item| ItemHandle(item.clone()).snapshot())
            .collect()
    }

    /// Whether a task with this action id is pending or running.
    pub fn is_action_queued(&self, action_id: u32) -> bool {
        let state = self.state.lock();
        state
            .current
            .as_ref()
            .is_some_and(|running| running.item.action_id() == action_id)
            || state.pending.iter().any(|item| item.action_id() == action_id)
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        QueueStatus {
            name: self.name.clone(),
            pending: state.pending.len(),
            paused: state.paused,
            min_priority: state.min_priority,
            shut_down: state.shut_down,
            current: state
                .current
                .as_ref()
                .map(|running| ItemHandle(running.item.clone()).snapshot()),
        }
    }

    /// Ask the running item to stop. Returns `false` if nothing is running.
    pub fn cancel_current(&self) -> bool {
        let state = self.state.lock();
        match state.current.as_ref() {
            Some(running) => {
                running.item.cancellation_token().cancel();
                info!(queue = %self.name, worker = %running.worker_name, "Cancelling current task");
                true
            }
            None => false,
        }
    }

    /// Permanently stop the queue.
    ///
    /// Further enqueues fail, nothing else is dispatched and every item's
    /// cancellation token fires. The running item still gets finalized by a
    /// later `tick`/`reconcile`. Returns the number of pending items left
    /// undispatched.
    pub fn shutdown(&self) -> usize {
        let abandoned = {
            let mut state = self.state.lock();
            if state.shut_down {
                return 0;
            }
            state.shut_down = true;
            state.pending.len()
        };

        self.cancellation_token.cancel();
        self.wakeup.notify_one();
        info!(queue = %self.name, abandoned, "Queue shut down");
        abandoned
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wakeup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemStatus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        executes: AtomicUsize,
        finishes: AtomicUsize,
    }

    #[async_trait]
    impl Task for Counting {
        fn name(&self) -> &str {
            "Counting task"
        }

        async fn execute(&self, _ctx: TaskContext) {
            self.executes.fetch_add(1, Ordering::SeqCst);
        }

        fn finish(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Runs until cancelled.
    struct WaitForCancel {
        observed_cancel: AtomicBool,
    }

    #[async_trait]
    impl Task for WaitForCancel {
        fn name(&self) -> &str {
            "long scan"
        }

        fn action_id(&self) -> u32 {
            42
        }

        async fn execute(&self, ctx: TaskContext) {
            ctx.cancelled().await;
            self.observed_cancel.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_tick_without_runtime_keeps_item() {
        let queue = TaskQueue::new("QUEUE");
        let handle = queue.enqueue(Counting::default()).unwrap();

        let result = queue.tick();
        assert!(matches!(result, Err(QueueError::NoRuntime)));
        assert_eq!(queue.len(), 1);
        assert_eq!(handle.status(), ItemStatus::Pending);
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_tick_from_plain_thread_uses_creating_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let queue = {
            let _enter = runtime.enter();
            Arc::new(TaskQueue::new("QUEUE"))
        };
        let task = Arc::new(Counting::default());
        let handle = queue.enqueue(task.clone()).unwrap();

        // A timer thread with no runtime of its own.
        let driver = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.tick().unwrap())
        };
        assert!(driver.join().unwrap().is_dispatched());

        runtime.block_on(queue.wait_current());
        assert!(queue.reconcile());
        assert_eq!(handle.status(), ItemStatus::Finished);
        assert_eq!(task.executes.load(Ordering::SeqCst), 1);
        assert_eq!(task.finishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enqueue_assigns_ids_and_stamps() {
        let queue = TaskQueue::new("QUEUE");
        let first = queue.enqueue(Counting::default()).unwrap();
        let second = queue.enqueue(Counting::default()).unwrap();

        assert_eq!(first.id() + 1, second.id());
        assert!(first.enqueued_at() <= second.enqueued_at());
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_with_config_applies_initial_state() {
        let config = QueueConfig {
            name: "SHOWQUEUE".to_string(),
            min_priority: Some(Priority::High),
            start_paused: true,
            ..QueueConfig::default()
        };
        let queue = TaskQueue::with_config(&config).unwrap();
        assert_eq!(queue.name(), "SHOWQUEUE");
        assert!(queue.is_paused());
        assert_eq!(queue.min_priority(), Some(Priority::High));

        let invalid = QueueConfig::named("");
        assert!(TaskQueue::with_config(&invalid).is_err());
    }

    #[tokio::test]
    async fn test_tick_dispatches_then_reconciles() {
        let queue = TaskQueue::new("QUEUE");
        let task = Arc::new(Counting::default());
        let handle = queue.enqueue(task.clone()).unwrap();

        let outcome = queue.tick().unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Dispatched {
                id: handle.id(),
                worker_name: "QUEUE-COUNTING-TASK".to_string(),
            }
        );
        assert_eq!(handle.status(), ItemStatus::Running);
        assert!(queue.is_empty());

        queue.wait_current().await;
        assert_eq!(queue.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(handle.status(), ItemStatus::Finished);
        assert_eq!(task.executes.load(Ordering::SeqCst), 1);
        assert_eq!(task.finishes.load(Ordering::SeqCst), 1);
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_current_reaches_task() {
        let queue = TaskQueue::new("QUEUE");
        let task = Arc::new(WaitForCancel {
            observed_cancel: AtomicBool::new(false),
        });
        let handle = queue.enqueue(task.clone()).unwrap();
        assert!(!queue.cancel_current());

        assert!(queue.tick().unwrap().is_dispatched());
        assert!(queue.is_action_queued(42));
        assert_eq!(queue.tick().unwrap(), TickOutcome::Busy);

        assert!(queue.cancel_current());
        queue.wait_current().await;
        assert!(queue.reconcile());
        assert!(task.observed_cancel.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
        assert_eq!(handle.status(), ItemStatus::Finished);
        assert!(!queue.is_action_queued(42));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_enqueue_and_dispatch() {
        let queue = TaskQueue::new("QUEUE");
        let running = Arc::new(WaitForCancel {
            observed_cancel: AtomicBool::new(false),
        });
        let running_handle = queue.enqueue(running.clone()).unwrap();
        assert!(queue.tick().unwrap().is_dispatched());
        let waiting = queue.enqueue(Counting::default()).unwrap();

        assert_eq!(queue.shutdown(), 1);
        assert_eq!(queue.shutdown(), 0);
        assert!(queue.is_shut_down());

        let err = queue.enqueue(Counting::default()).unwrap_err();
        assert!(err.is_shut_down());

        queue.wait_current().await;
        assert_eq!(queue.tick().unwrap(), TickOutcome::ShutDown);
        assert_eq!(running_handle.status(), ItemStatus::Finished);
        assert!(running.observed_cancel.load(Ordering::SeqCst));
        assert_eq!(waiting.status(), ItemStatus::Pending);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_current_item() {
        let queue = TaskQueue::new("QUEUE");
        queue.enqueue(Counting::default()).unwrap();
        queue.enqueue(Counting::default()).unwrap();
        queue.set_min_priority(Some(Priority::Low));

        assert!(queue.tick().unwrap().is_dispatched());
        let status = queue.status();
        assert_eq!(status.name, "QUEUE");
        assert_eq!(status.pending, 1);
        assert_eq!(status.min_priority, Some(Priority::Low));
        assert!(!status.paused);
        let current = status.current.expect("current item");
        assert_eq!(current.status, ItemStatus::Running);
        assert_eq!(queue.pending_items().len(), 1);

        let json = serde_json::to_value(queue.status()).unwrap();
        assert_eq!(json["name"], "QUEUE");
        assert_eq!(json["min_priority"], "LOW");
    }
}
