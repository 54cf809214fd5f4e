//! Implementation of the `abort` command.

use std::collections::BTreeSet;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;

use crate::commands::CliState;
use crate::commands::EXIT_COMPLETED;
use crate::config::PipelineConfig;
use crate::scheduler::ArrayJobId;
use crate::scheduler::Scheduler as _;
use crate::scheduler::SlurmScheduler;
use crate::store::FileStore;
use crate::store::RunLayout;
use crate::store::Store as _;

/// Arguments for the `abort` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// Name of the job whose buckets should be cancelled.
    #[arg(short, long)]
    pub job: Option<String>,

    /// Cancel everything and signal the supervisor to exit.
    #[arg(long)]
    pub all: bool,
}

/// Cancels outstanding array jobs, and with `--all` also signals the
/// supervisor so it can persist cancellations and exit.
pub async fn abort(args: Args) -> Result<i32> {
    if args.job.is_none() && !args.all {
        bail!("please provide either -j/--job or --all");
    }

    let state = CliState::load()?;
    let config = PipelineConfig::load(&state.config)?;

    if let Some(job) = &args.job
        && config.job(job).is_none()
    {
        bail!("unknown job `{job}`");
    }

    let layout = RunLayout::open_latest(&config)?;
    let store = FileStore::open(&layout)?;

    let arrays: BTreeSet<u64> = store
        .snapshot()
        .await?
        .into_iter()
        .filter(|wp| wp.state.is_in_flight())
        .filter(|wp| args.job.as_deref().is_none_or(|job| wp.base_job() == job))
        .filter_map(|wp| wp.external.map(|e| e.array_job_id))
        .collect();

    let scheduler = SlurmScheduler::new();
    for array_job_id in &arrays {
        scheduler.cancel(ArrayJobId(*array_job_id), None).await?;
    }

    match &args.job {
        Some(job) => println!(
            "cancelled {count} outstanding arrays of job `{job}`",
            count = arrays.len()
        ),
        None => println!("cancelled {count} outstanding arrays", count = arrays.len()),
    }

    if args.all {
        // The supervisor persists the cancellations and exits with the
        // abort code once signalled.
        let status = tokio::process::Command::new("kill")
            .arg("-TERM")
            .arg(state.pid.to_string())
            .status()
            .await?;

        if status.success() {
            println!("supervisor (pid {}) signalled to abort", state.pid);
        } else {
            println!("supervisor (pid {}) is no longer running", state.pid);
        }
    }

    Ok(EXIT_COMPLETED)
}
