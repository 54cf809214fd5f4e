//! Implementation of the `retry` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::commands::CliState;
use crate::commands::EXIT_COMPLETED;
use crate::commands::apply_overrides;
use crate::commands::start::run_supervisor;
use crate::config::PipelineConfig;
use crate::store::FileStore;
use crate::store::RunLayout;
use crate::store::Store as _;
use crate::store::WorkState;

/// Arguments for the `retry` command.
#[derive(Parser, Debug)]
pub struct Args {
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

/// Restarts the supervisor against the previous run's store, resubmitting
/// only the terminally failed work packages.
///
/// Bucket assignments are preserved exactly as recorded; special-case
/// predicates are not re-evaluated. With zero failed packages this is a
/// no-op.
pub async fn retry(args: Args) -> Result<i32> {
    let state = CliState::load()?;
    let mut config = PipelineConfig::load(&state.config)?;
    apply_overrides(&mut config, args.account, args.log_dir, args.env);

    let layout = RunLayout::open_latest(&config)?;
    let store = Arc::new(FileStore::open(&layout)?);

    let failed: Vec<_> = store
        .snapshot()
        .await?
        .into_iter()
        .filter(|wp| wp.state == WorkState::Failed)
        .collect();

    if failed.is_empty() {
        println!("no failed work packages in run `{}`; nothing to retry", layout.run_id());
        return Ok(EXIT_COMPLETED);
    }

    info!(
        "requeueing {count} failed work packages from run `{run_id}`",
        count = failed.len(),
        run_id = layout.run_id(),
    );

    for mut wp in failed {
        wp.reset_for_retry();
        store.upsert(&wp).await?;
    }

    CliState {
        pid: std::process::id(),
        ..state
    }
    .save()?;

    run_supervisor(config, layout, store).await
}
