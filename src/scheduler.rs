//! The external-scheduler adapter.
//!
//! The supervisor requires a minimal contract from any workload manager:
//! submit a bucket as an array job, query per-task states, best-effort
//! cancellation, and active-array discovery for restart reconciliation.
//! There is one production implementation over Slurm and one in-memory
//! implementation for tests.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::Resources;
use crate::store::ExternalId;

pub mod slurm;
pub mod testing;

pub use slurm::SlurmScheduler;
pub use testing::VirtualScheduler;

/// Scheduler adapter errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A scheduler command could not be spawned.
    #[error("failed to spawn `{program}`")]
    Spawn {
        /// The program that failed to spawn.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A scheduler command exited unsuccessfully.
    #[error("`{program}` failed ({status}): {stderr}")]
    Command {
        /// The program that failed.
        program: String,
        /// The exit status.
        status: String,
        /// The captured stderr.
        stderr: String,
    },

    /// A scheduler query exceeded its deadline.
    ///
    /// The supervisor treats this as "no information" and re-queries on
    /// the next poll tick.
    #[error("`{program}` did not answer within {seconds}s")]
    Timeout {
        /// The program that timed out.
        program: String,
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// Scheduler output could not be parsed.
    #[error("unexpected scheduler output: {0}")]
    Parse(String),

    /// An I/O error while preparing a submission.
    #[error("scheduler i/o error on `{path}`")]
    Io {
        /// The affected path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// The identifier of a submitted array job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayJobId(pub u64);

impl fmt::Display for ArrayJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ArrayJobId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| SchedulerError::Parse(format!("invalid array job id `{s}`")))
    }
}

/// The observed state of a single array task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The task is queued and waiting for initiation.
    Pending,
    /// The task is currently running.
    Running,
    /// The task completed with a zero exit code.
    Succeeded,
    /// The task terminated unsuccessfully with the given exit code.
    Failed(i32),
}

impl TaskState {
    /// Determines whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// A bucket submission handed to the scheduler.
#[derive(Debug, Clone)]
pub struct ArrayRequest {
    /// The bucket name, used as the scheduler-level job name.
    pub name: String,
    /// The user script executed once per task.
    pub script: PathBuf,
    /// The conda environment activated by the launcher.
    pub conda_env: PathBuf,
    /// The account the job is billed against.
    pub account: String,
    /// The resource request applied to every task.
    pub resources: Resources,
    /// The parameter records; task `i` consumes element `i` of the work
    /// file the adapter writes from them.
    pub records: Vec<Value>,
    /// The run directory: working directory for tasks, destination for
    /// work files and per-task logs.
    pub run_dir: PathBuf,
}

impl ArrayRequest {
    /// Gets the number of tasks in the array.
    pub fn array_size(&self) -> u32 {
        self.records.len() as u32
    }
}

/// Derives the stdout log path for a submitted task.
///
/// Worker logs are written into the run directory as
/// `<array_job_id>_<task_id>.stdout` / `.stderr`.
pub fn stdout_log(run_dir: &Path, external: ExternalId) -> PathBuf {
    run_dir.join(format!("{external}.stdout"))
}

/// Derives the stderr log path for a submitted task.
pub fn stderr_log(run_dir: &Path, external: ExternalId) -> PathBuf {
    run_dir.join(format!("{external}.stderr"))
}

/// The contract the supervisor requires from a workload manager.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedules a bucket of tasks as one array job.
    ///
    /// The adapter writes the work file and hides the launcher
    /// choreography; task `i` receives record `i` on stdin.
    async fn submit_array(&self, request: &ArrayRequest) -> Result<ArrayJobId>;

    /// Queries the per-task states of an array job.
    ///
    /// An array the scheduler no longer knows yields an empty map.
    async fn query(&self, id: ArrayJobId) -> Result<HashMap<u32, TaskState>>;

    /// Best-effort termination of an array job, or of the given tasks
    /// within it.
    async fn cancel(&self, id: ArrayJobId, task_ids: Option<&[u32]>) -> Result<()>;

    /// Lists array jobs still known to the scheduler for the given account
    /// whose job name is `name_prefix` or a `.`-suffixed bucket of it.
    ///
    /// Used for restart-time reconciliation.
    async fn list_active(&self, account: &str, name_prefix: &str) -> Result<Vec<ArrayJobId>>;
}

/// Determines whether a scheduler-level job name belongs to the given base
/// job: either the name itself or one of its `.`-suffixed buckets.
pub(crate) fn name_matches(job_name: &str, name_prefix: &str) -> bool {
    job_name == name_prefix
        || job_name
            .strip_prefix(name_prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}
