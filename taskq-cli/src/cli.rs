use std::path::PathBuf;

use clap::{Parser, Subcommand};
use task_queue::Priority;

use crate::job::JobSpec;

/// Taskq - run synthetic jobs through a single-flight priority queue
#[derive(Parser, Debug)]
#[command(name = "taskq", version, about, long_about = None)]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "TASKQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enqueue jobs and run them until the queue drains
    Run {
        /// Job as `name[:PRIORITY[:millis]]`, e.g. "Rename show:HIGH:500"
        #[arg(short, long = "job", value_parser = JobSpec::parse, required = true)]
        jobs: Vec<JobSpec>,

        /// Queue name (overrides the config file)
        #[arg(long)]
        name: Option<String>,

        /// Admission floor (overrides the config file)
        #[arg(long, value_parser = parse_priority)]
        min_priority: Option<Priority>,

        /// Dispatch interval in milliseconds (overrides the config file)
        #[arg(long)]
        interval: Option<u64>,

        /// Keep the queue paused for this many milliseconds after enqueueing
        #[arg(long, value_name = "MILLIS")]
        pause_for: Option<u64>,

        /// Names of jobs that should fail
        #[arg(long = "fail", value_name = "NAME")]
        fail: Vec<String>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    s.parse()
}
