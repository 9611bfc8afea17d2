//! Periodic driver for a [`TaskQueue`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::queue::{TaskQueue, TickOutcome};

/// Drives [`TaskQueue::tick`] on a fixed interval.
///
/// Besides the interval, the loop ticks immediately when an item is enqueued,
/// when the floor drops, and when the running worker completes, so
/// finalization does not wait for the next interval.
pub struct DispatchLoop {
    queue: Arc<TaskQueue>,
    cancellation_token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DispatchLoop {
    /// Start driving `queue` with the interval from `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(queue: Arc<TaskQueue>, config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        Self::with_interval(queue, config.tick_interval())
    }

    /// Start driving `queue` with an explicit interval.
    ///
    /// Fails on a zero interval.
    pub fn with_interval(queue: Arc<TaskQueue>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(QueueError::config("dispatch interval must be greater than 0"));
        }

        let cancellation_token = CancellationToken::new();

        info!(
            queue = %queue.name(),
            interval_ms = interval.as_millis() as u64,
            "Starting dispatch loop"
        );

        let task = {
            let queue = queue.clone();
            let cancellation_token = cancellation_token.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancellation_token.cancelled() => {
                            debug!(queue = %queue.name(), "Dispatch loop shutting down");
                            break;
                        }
                        _ = queue.wakeup().notified() => {
                            // Enqueue, unpause or worker completion
                        }
                        _ = ticker.tick() => {}
                    }

                    match queue.tick() {
                        Ok(TickOutcome::ShutDown) => {
                            if !queue.is_busy() {
                                debug!(queue = %queue.name(), "Queue shut down and idle, stopping dispatch loop");
                                break;
                            }
                        }
                        Ok(outcome) => {
                            debug!(queue = %queue.name(), ?outcome, "Dispatch tick");
                        }
                        Err(e) => {
                            error!(queue = %queue.name(), error = %e, "Dispatch tick failed");
                        }
                    }
                }
            })
        };

        Ok(Self {
            queue,
            cancellation_token,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// The queue this loop drives.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Check if the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
            && self
                .task
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop, then wait for the in-flight worker and finalize it.
    ///
    /// Pending items are left in the queue.
    pub async fn stop(&self) {
        info!(queue = %self.queue.name(), "Stopping dispatch loop");
        self.cancellation_token.cancel();

        // Take the handle out of the mutex before awaiting
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(queue = %self.queue.name(), error = %e, "Dispatch loop task failed");
        }

        self.queue.wait_current().await;
        self.queue.reconcile();

        info!(queue = %self.queue.name(), pending = self.queue.len(), "Dispatch loop stopped");
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemStatus, Task, TaskContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Quick;

    #[async_trait]
    impl Task for Quick {
        fn name(&self) -> &str {
            "quick"
        }

        async fn execute(&self, _ctx: TaskContext) {}
    }

    /// Sleeps long enough to still be running when the loop is stopped.
    #[derive(Default)]
    struct Slow {
        finishes: AtomicUsize,
    }

    #[async_trait]
    impl Task for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _ctx: TaskContext) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        fn finish(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let queue = Arc::new(TaskQueue::new("QUEUE"));

        let config = QueueConfig {
            tick_interval_ms: 0,
            ..QueueConfig::default()
        };
        let err = DispatchLoop::spawn(queue.clone(), &config).err().unwrap();
        assert!(matches!(err, QueueError::Configuration(_)));

        let err = DispatchLoop::with_interval(queue.clone(), Duration::ZERO)
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Configuration(_)));

        // The queue is untouched and can still be driven.
        let handle = queue.enqueue(Quick).unwrap();
        let dispatch = DispatchLoop::with_interval(queue.clone(), Duration::from_millis(10)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_finished())
            .await
            .expect("item should finish");
        dispatch.stop().await;
    }

    #[tokio::test]
    async fn test_stop_finalizes_running_item() {
        let queue = Arc::new(TaskQueue::new("QUEUE"));
        let task = Arc::new(Slow::default());
        let handle = queue.enqueue(task.clone()).unwrap();
        let waiting = queue.enqueue(Quick).unwrap();

        let dispatch = DispatchLoop::with_interval(queue.clone(), Duration::from_secs(3600)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.status() != ItemStatus::Running {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("item should start");

        dispatch.stop().await;
        assert!(!dispatch.is_running());
        assert_eq!(handle.status(), ItemStatus::Finished);
        assert_eq!(task.finishes.load(Ordering::SeqCst), 1);
        assert!(!queue.is_busy());

        // Pending work stays put once the loop is gone.
        assert_eq!(waiting.status(), ItemStatus::Pending);
        assert_eq!(queue.len(), 1);

        // A later reconcile has nothing left to finalize.
        assert!(!queue.reconcile());
        assert_eq!(task.finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_runs_queue_to_completion() {
        let queue = Arc::new(TaskQueue::new("QUEUE"));
        let handles: Vec<_> = (0..3).map(|_| queue.enqueue(Quick).unwrap()).collect();

        // An hour-long interval: progress can only come from wakeups.
        let dispatch = DispatchLoop::with_interval(queue.clone(), Duration::from_secs(3600)).unwrap();
        assert!(dispatch.is_running());

        for handle in &handles {
            tokio::time::timeout(Duration::from_secs(5), handle.wait_finished())
                .await
                .expect("item should finish");
            assert_eq!(handle.status(), ItemStatus::Finished);
        }

        dispatch.stop().await;
        assert!(!dispatch.is_running());
        assert!(queue.is_empty());
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn test_loop_exits_after_shutdown() {
        let queue = Arc::new(TaskQueue::new("QUEUE"));
        let dispatch = DispatchLoop::spawn(queue.clone(), &QueueConfig::default()).unwrap();

        queue.shutdown();
        let task = dispatch.task.lock().take().unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop should exit")
            .unwrap();
    }
}
