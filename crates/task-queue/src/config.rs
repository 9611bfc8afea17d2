//! Queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::priority::Priority;

/// Default queue name, used as the worker-name prefix.
pub const DEFAULT_QUEUE_NAME: &str = "QUEUE";

/// Default dispatch interval (1 second).
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Configuration for a [`TaskQueue`](crate::TaskQueue) and its dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, prefixed to every worker name.
    pub name: String,
    /// Interval between dispatch ticks in milliseconds.
    ///
    /// The loop also wakes early on enqueue and on worker completion, so this
    /// only bounds latency for deferred items.
    pub tick_interval_ms: u64,
    /// Initial admission floor. `None` admits every priority.
    pub min_priority: Option<Priority>,
    /// Start with dispatch paused.
    pub start_paused: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            min_priority: None,
            start_paused: false,
        }
    }
}

impl QueueConfig {
    /// Create a default configuration with the given queue name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(QueueError::config("queue name must not be empty"));
        }
        if self.tick_interval_ms == 0 {
            return Err(QueueError::config("tick_interval_ms must be greater than 0"));
        }
        Ok(())
    }
}
