//! Implementation of the `work` command.

use anyhow::Result;
use anyhow::bail;
use clap::Parser;

use crate::commands::CliState;
use crate::commands::EXIT_COMPLETED;
use crate::config::PipelineConfig;
use crate::store::FileStore;
use crate::store::RunLayout;
use crate::store::Store as _;

/// Arguments for the `work` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job whose work packages should be listed.
    pub job: String,
}

/// Lists a job's work packages with state, attempt, and parameters.
pub async fn work(args: Args) -> Result<i32> {
    let state = CliState::load()?;
    let config = PipelineConfig::load(&state.config)?;

    if config.job(&args.job).is_none() {
        bail!("unknown job `{}`", args.job);
    }

    let layout = RunLayout::open_latest(&config)?;
    let store = FileStore::open(&layout)?;

    let packages = store.job(&args.job).await?;
    println!("{}", serde_json::to_string_pretty(&packages)?);

    Ok(EXIT_COMPLETED)
}
