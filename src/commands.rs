//! Implementation of the capstan subcommands.

use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

pub mod abort;
pub mod logs;
pub mod retry;
pub mod start;
pub mod status;
pub mod work;

/// The process exit code for a pipeline that ran to completion.
///
/// Failed work packages are reported but are not fatal to the CLI.
pub const EXIT_COMPLETED: i32 = 0;

/// The process exit code for an aborted pipeline.
pub const EXIT_ABORTED: i32 = 130;

/// The file recording where the most recent `start` ran.
const STATE_FILE: &str = ".capstan.json";

/// CLI bookkeeping persisted by `start` so the read-only subcommands can
/// find the active run from any shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliState {
    /// The pipeline config path, as resolved at start time.
    pub config: PathBuf,
    /// The run identifier.
    pub run_id: String,
    /// The account used for scheduling.
    pub account: String,
    /// The supervisor process id.
    pub pid: u32,
}

impl CliState {
    /// Gets the path of the CLI state file.
    fn path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(STATE_FILE)
    }

    /// Persists the CLI state.
    pub fn save(&self) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(), body).context("failed to write CLI state")
    }

    /// Loads the CLI state from the most recent `start`.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        let body = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "no CLI state at `{}`; has a pipeline been started?",
                path.display()
            )
        })?;

        serde_json::from_str(&body).context("failed to parse CLI state")
    }
}

/// Applies the shared `--account`, `--log-dir`, and `--env` overrides to a
/// loaded configuration.
///
/// A `--log-dir` override reroots every job's log directory to
/// `<log_dir>/<job name>`.
pub(crate) fn apply_overrides(
    config: &mut crate::config::PipelineConfig,
    account: Option<String>,
    log_dir: Option<PathBuf>,
    env: Option<PathBuf>,
) {
    if let Some(account) = account {
        config.properties.account = account;
    }

    if let Some(env) = env {
        config.properties.conda_env = env;
    }

    if let Some(log_dir) = log_dir {
        for job in &mut config.jobs {
            job.log_dir = log_dir.join(&job.name);
        }
    }
}
