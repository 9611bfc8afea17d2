//! # Task Queue
//!
//! A single-flight priority work queue. Producers enqueue [`Task`]s, a driver
//! calls [`TaskQueue::tick`] (directly or through a [`DispatchLoop`]) and the
//! queue runs at most one task at a time.
//!
//! ## Features
//!
//! - Strict FIFO dispatch; priority only gates admission of the head item
//! - Cooperative pause/unpause and an adjustable admission floor
//! - Exactly-once finalization of every dispatched task, including panics
//! - Per-task cancellation tokens and queue shutdown
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use task_queue::{DispatchLoop, Priority, QueueConfig, Task, TaskContext, TaskQueue};
//!
//! struct Refresh;
//!
//! #[async_trait]
//! impl Task for Refresh {
//!     fn name(&self) -> &str {
//!         "Refresh show"
//!     }
//!
//!     fn priority(&self) -> Priority {
//!         Priority::High
//!     }
//!
//!     async fn execute(&self, _ctx: TaskContext) {}
//! }
//!
//! # async fn run() -> task_queue::Result<()> {
//! let config = QueueConfig::named("SHOWQUEUE");
//! let queue = Arc::new(TaskQueue::with_config(&config)?);
//! let dispatch = DispatchLoop::spawn(queue.clone(), &config)?;
//!
//! let handle = queue.enqueue(Refresh)?;
//! handle.wait_finished().await;
//! dispatch.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod item;
pub mod priority;
pub mod queue;

pub use config::QueueConfig;
pub use dispatch::DispatchLoop;
pub use error::{QueueError, Result};
pub use item::{ItemHandle, ItemSnapshot, ItemStatus, Task, TaskContext, default_thread_name};
pub use priority::Priority;
pub use queue::{QueueStatus, TaskQueue, TickOutcome};
