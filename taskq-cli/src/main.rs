mod cli;
mod config;
mod error;
mod job;

use std::collections::HashSet;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use task_queue::{DispatchLoop, ItemHandle, ItemStatus, Priority, TaskQueue};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    config::AppConfig,
    error::{AppError, Result},
    job::{JobOutcome, JobSpec, SleepJob},
};

/// How often the CLI checks whether the run has settled.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let mut config = AppConfig::load(args.config.as_deref())?;

    match args.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run {
            jobs,
            name,
            min_priority,
            interval,
            pause_for,
            fail,
            json,
        } => {
            if let Some(name) = name {
                config.queue.name = name;
            }
            if let Some(min_priority) = min_priority {
                config.queue.min_priority = Some(min_priority);
            }
            if let Some(interval) = interval {
                config.queue.tick_interval_ms = interval;
            }

            let fail: HashSet<String> = fail.into_iter().collect();
            let report = run_jobs(&config, jobs, &fail, pause_for.map(Duration::from_millis)).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct JobReport {
    id: u64,
    name: String,
    priority: Priority,
    status: ItemStatus,
    outcome: JobOutcome,
    waited_ms: Option<i64>,
    ran_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    queue: String,
    interrupted: bool,
    jobs: Vec<JobReport>,
}

async fn run_jobs(
    config: &AppConfig,
    specs: Vec<JobSpec>,
    fail: &HashSet<String>,
    pause_for: Option<Duration>,
) -> Result<RunReport> {
    let queue = Arc::new(TaskQueue::with_config(&config.queue)?);
    let dispatch = DispatchLoop::spawn(queue.clone(), &config.queue)?;

    if pause_for.is_some() {
        queue.pause();
    }

    let mut enqueued: Vec<(Arc<SleepJob>, ItemHandle)> = Vec::with_capacity(specs.len());
    for spec in specs {
        let should_fail = fail.contains(&spec.name);
        let job = Arc::new(SleepJob::new(spec, should_fail));
        let handle = queue.enqueue(job.clone())?;
        enqueued.push((job, handle));
    }
    info!(queue = %queue.name(), jobs = enqueued.len(), "Jobs enqueued");

    if let Some(pause_for) = pause_for {
        tokio::time::sleep(pause_for).await;
        queue.unpause();
    }

    let interrupted = tokio::select! {
        _ = wait_until_settled(&queue, &enqueued) => false,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling current job");
            queue.cancel_current();
            true
        }
    };

    let abandoned = queue.shutdown();
    dispatch.stop().await;
    if abandoned > 0 {
        warn!(abandoned, "Jobs left in the queue");
    }

    let jobs = enqueued
        .iter()
        .map(|(job, handle)| {
            let snapshot = handle.snapshot();
            JobReport {
                id: snapshot.id,
                name: snapshot.name,
                priority: snapshot.priority,
                status: snapshot.status,
                outcome: job.outcome(),
                waited_ms: snapshot
                    .started_at
                    .map(|started| (started - snapshot.enqueued_at).num_milliseconds()),
                ran_ms: snapshot
                    .started_at
                    .zip(snapshot.finished_at)
                    .map(|(started, finished)| (finished - started).num_milliseconds()),
            }
        })
        .collect();

    Ok(RunReport {
        queue: queue.name().to_string(),
        interrupted,
        jobs,
    })
}

/// Resolves once every job finished, or once the head job is stuck below the
/// admission floor with nothing running.
async fn wait_until_settled(queue: &TaskQueue, enqueued: &[(Arc<SleepJob>, ItemHandle)]) {
    let mut ticker = tokio::time::interval(SETTLE_POLL_INTERVAL);
    loop {
        ticker.tick().await;

        if enqueued
            .iter()
            .all(|(_, handle)| handle.status() == ItemStatus::Finished)
        {
            return;
        }

        let status = queue.status();
        let head_blocked = queue
            .pending_items()
            .first()
            .is_some_and(|head| !head.priority.meets(status.min_priority));
        if status.current.is_none() && !status.paused && head_blocked {
            warn!(
                queue = %status.name,
                pending = status.pending,
                "Head job is below the admission floor; remaining jobs will not run"
            );
            return;
        }
    }
}

fn print_report(report: &RunReport) {
    println!("Queue {}{}", report.queue, if report.interrupted { " (interrupted)" } else { "" });
    for job in &report.jobs {
        println!(
            "  #{:<3} {:<24} {:<6} {:<8} {:<9} waited {:>6} ms, ran {:>6} ms",
            job.id,
            job.name,
            job.priority.as_str(),
            job.status.to_string(),
            format!("{:?}", job.outcome).to_lowercase(),
            job.waited_ms.map_or("-".to_string(), |ms| ms.to_string()),
            job.ran_ms.map_or("-".to_string(), |ms| ms.to_string()),
        );
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
