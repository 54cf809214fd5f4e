//! Implementation of the `start` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing::warn;

use crate::commands::CliState;
use crate::commands::EXIT_ABORTED;
use crate::commands::EXIT_COMPLETED;
use crate::commands::apply_overrides;
use crate::config::PipelineConfig;
use crate::notify::LogNotifier;
use crate::scheduler::SlurmScheduler;
use crate::store::FileStore;
use crate::store::RunLayout;
use crate::supervisor::Outcome;
use crate::supervisor::Supervisor;

/// Arguments for the `start` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// Path to the pipeline config file.
    pub config: PathBuf,

    /// Slurm account to schedule tasks with.
    #[arg(short, long)]
    pub account: Option<String>,

    /// Base directory that reroots every job's log directory.
    #[arg(short, long)]
    pub log_dir: Option<PathBuf>,

    /// Conda environment activated for work packages.
    #[arg(short, long)]
    pub env: Option<PathBuf>,
}

/// Starts the supervisor over a fresh run and drives the pipeline to
/// completion.
pub async fn start(args: Args) -> Result<i32> {
    let mut config = PipelineConfig::load(&args.config)?;
    apply_overrides(&mut config, args.account, args.log_dir, args.env);

    let layout = RunLayout::create(&config)?;
    let store = Arc::new(FileStore::open(&layout)?);

    let state = CliState {
        config: std::fs::canonicalize(&args.config).unwrap_or(args.config),
        run_id: layout.run_id().to_string(),
        account: config.properties.account.clone(),
        pid: std::process::id(),
    };
    state.save()?;

    info!("starting pipeline run `{}`", layout.run_id());
    run_supervisor(config, layout, store).await
}

/// Runs a supervisor over the given run, wiring up signal-driven aborts,
/// and maps the outcome to a process exit code.
pub(crate) async fn run_supervisor(
    config: PipelineConfig,
    layout: RunLayout,
    store: Arc<FileStore>,
) -> Result<i32> {
    let supervisor = Supervisor::new(
        config.properties.clone(),
        store,
        Arc::new(SlurmScheduler::new()),
        Arc::new(LogNotifier),
    );

    let token = supervisor.cancellation_token();
    tokio::spawn(async move {
        use tokio::signal::unix::SignalKind;

        let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }

        info!("abort signal received");
        token.cancel();
    });

    match supervisor
        .run(&config, &layout)
        .await
        .context("supervisor failed")?
    {
        Outcome::Completed(summary) => {
            let totals = summary.totals();
            println!(
                "pipeline completed: {succeeded} succeeded, {failed} failed of {total} work \
                 packages",
                succeeded = totals.succeeded,
                failed = totals.failed,
                total = totals.total(),
            );
            Ok(EXIT_COMPLETED)
        }
        Outcome::Aborted(_) => {
            println!("pipeline aborted");
            Ok(EXIT_ABORTED)
        }
    }
}
