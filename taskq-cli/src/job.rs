//! Synthetic jobs used to exercise the queue.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use task_queue::{Priority, Task, TaskContext};
use tracing::{info, warn};

const DEFAULT_JOB_MILLIS: u64 = 250;

/// A job described on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub priority: Priority,
    pub duration: Duration,
}

impl JobSpec {
    /// Parse `name[:PRIORITY[:millis]]`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = s.splitn(3, ':');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(format!("Job name must not be empty: '{}'", s));
        }

        let priority = match parts.next() {
            Some(p) if !p.trim().is_empty() => p.parse()?,
            _ => Priority::default(),
        };
        let millis = match parts.next() {
            Some(ms) => ms
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("Invalid duration '{}': {}", ms, e))?,
            None => DEFAULT_JOB_MILLIS,
        };

        Ok(Self {
            name: name.to_string(),
            priority,
            duration: Duration::from_millis(millis),
        })
    }
}

/// How a job ended, recorded by the job itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    NotRun,
    Completed,
    Failed,
    Cancelled,
}

/// Sleeps for its duration, or fails on request.
#[derive(Debug)]
pub struct SleepJob {
    spec: JobSpec,
    should_fail: bool,
    outcome: Mutex<JobOutcome>,
}

impl SleepJob {
    pub fn new(spec: JobSpec, should_fail: bool) -> Self {
        Self {
            spec,
            should_fail,
            outcome: Mutex::new(JobOutcome::NotRun),
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        *self.outcome.lock()
    }

    fn record(&self, outcome: JobOutcome) {
        *self.outcome.lock() = outcome;
    }
}

#[async_trait]
impl Task for SleepJob {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn priority(&self) -> Priority {
        self.spec.priority
    }

    async fn execute(&self, ctx: TaskContext) {
        info!(duration_ms = self.spec.duration.as_millis() as u64, "Job started");

        tokio::select! {
            _ = ctx.cancelled() => {
                self.record(JobOutcome::Cancelled);
                return;
            }
            _ = tokio::time::sleep(self.spec.duration) => {}
        }

        if self.should_fail {
            self.record(JobOutcome::Failed);
        } else {
            self.record(JobOutcome::Completed);
        }
    }

    fn finish(&self) {
        match self.outcome() {
            JobOutcome::Completed => info!(job = %self.spec.name, "Job completed"),
            outcome => warn!(job = %self.spec.name, ?outcome, "Job did not complete"),
        }
    }
}
