//! Implementation of the `status` command.

use anyhow::Result;

use crate::commands::CliState;
use crate::commands::EXIT_COMPLETED;
use crate::config::PipelineConfig;
use crate::store::FileStore;
use crate::store::RunLayout;
use crate::store::StateCounts;
use crate::store::Store as _;

/// Prints per-job work-package counts for the active run.
pub async fn status() -> Result<i32> {
    let state = CliState::load()?;
    let config = PipelineConfig::load(&state.config)?;
    let layout = RunLayout::open_latest(&config)?;
    let store = FileStore::open(&layout)?;

    println!("run {}", layout.run_id());
    for job in &config.jobs {
        let counts = StateCounts::tally(&store.job(&job.name).await?);
        println!("{}", job.name);
        println!("  pending:   {}", counts.pending);
        println!("  running:   {}", counts.running);
        println!("  succeeded: {}", counts.succeeded);
        println!("  failed:    {}", counts.failed);
        if counts.cancelled > 0 {
            println!("  cancelled: {}", counts.cancelled);
        }
    }

    Ok(EXIT_COMPLETED)
}
