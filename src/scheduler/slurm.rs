//! The production Slurm adapter.
//!
//! Submission, monitoring, and cancellation are driven through the Slurm
//! command-line tools: `sbatch` for array submission, `sacct` for per-task
//! state, `scancel` for termination, and `squeue` for restart-time
//! discovery. The worker-side launcher script is a versioned asset owned
//! by this adapter and materialized into the run directory on first
//! submission.

use std::collections::HashMap;
use std::collections::HashSet;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use tracing::trace;
use uuid::Uuid;

use super::ArrayJobId;
use super::ArrayRequest;
use super::Result;
use super::Scheduler;
use super::SchedulerError;
use super::TaskState;
use super::name_matches;

/// The launcher script asset, versioned with the crate.
const LAUNCHER: &str = include_str!("../../assets/launcher.sh");

/// The launcher file name within a run directory.
const LAUNCHER_FILE: &str = "launcher.sh";

/// The subdirectory of the run directory holding bucket work files.
const WORK_DIR: &str = "work";

/// The default deadline for `sacct` queries, in seconds.
const DEFAULT_QUERY_DEADLINE: u64 = 30;

/// The fields requested from `sacct`.
///
/// Must be kept in sync with [`parse_sacct_row`].
const SACCT_FIELDS: &str = "JobID,State,ExitCode";

/// The synthetic exit code reported for a task killed by a timeout.
const EXIT_TIMEOUT: i32 = 124;

/// The synthetic exit code reported for a task killed by the OOM killer.
const EXIT_OOM: i32 = 137;

/// The synthetic exit code reported for a cancelled task.
const EXIT_CANCELLED: i32 = 130;

/// The synthetic exit code reported for scheduler-side failures (node
/// boot failure, node failure, revocation, and similar).
const EXIT_SCHEDULER: i32 = -1;

/// A Slurm job state, as reported by `sacct` or `squeue`.
///
/// See <https://slurm.schedmd.com/job_state_codes.html>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlurmState {
    /// The job was terminated due to node boot failure.
    BootFail,
    /// The job was cancelled by the user or administrator.
    Cancelled,
    /// The job completed with a zero exit code.
    Completed,
    /// The job is completing.
    Completing,
    /// The job is being configured.
    Configuring,
    /// The job was terminated due to exceeding a deadline.
    Deadline,
    /// The job finished with a non-zero exit code.
    Failed,
    /// The job was terminated due to node failure.
    NodeFail,
    /// The job was terminated by the OOM killer.
    OutOfMemory,
    /// The job is queued.
    Pending,
    /// The job was preempted.
    Preempted,
    /// The job is running.
    Running,
    /// The job was requeued.
    Requeued,
    /// The job is resizing.
    Resizing,
    /// The job was revoked from a sibling cluster.
    Revoked,
    /// The job is suspended.
    Suspended,
    /// The job exceeded its time limit.
    Timeout,
    /// A state this adapter does not recognize.
    Unknown,
}

impl FromStr for SlurmState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        // `sacct` decorates some states, e.g. `CANCELLED by 1234`.
        let state = s.split_whitespace().next().unwrap_or("");
        Ok(match state {
            "BOOT_FAIL" => Self::BootFail,
            "CANCELLED" => Self::Cancelled,
            "COMPLETED" => Self::Completed,
            "COMPLETING" => Self::Completing,
            "CONFIGURING" => Self::Configuring,
            "DEADLINE" => Self::Deadline,
            "FAILED" => Self::Failed,
            "NODE_FAIL" => Self::NodeFail,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            "PENDING" => Self::Pending,
            "PREEMPTED" => Self::Preempted,
            "RUNNING" => Self::Running,
            "REQUEUED" => Self::Requeued,
            "RESIZING" => Self::Resizing,
            "REVOKED" => Self::Revoked,
            "SUSPENDED" => Self::Suspended,
            "TIMEOUT" => Self::Timeout,
            _ => Self::Unknown,
        })
    }
}

impl SlurmState {
    /// Maps the Slurm state alphabet onto the adapter's task-state
    /// contract.
    ///
    /// `exit_code` is the code parsed from the `ExitCode` field and only
    /// consulted for plain failures; scheduler-side terminations get
    /// synthetic codes so the retry policy can act on them uniformly.
    fn to_task_state(self, exit_code: Option<i32>) -> TaskState {
        match self {
            Self::Completed => TaskState::Succeeded,
            Self::Pending | Self::Configuring | Self::Requeued | Self::Resizing => {
                TaskState::Pending
            }
            Self::Running | Self::Completing | Self::Suspended => TaskState::Running,
            Self::Failed => TaskState::Failed(exit_code.unwrap_or(1)),
            Self::Timeout | Self::Deadline => TaskState::Failed(EXIT_TIMEOUT),
            Self::OutOfMemory => TaskState::Failed(EXIT_OOM),
            Self::Cancelled | Self::Preempted => TaskState::Failed(EXIT_CANCELLED),
            Self::BootFail | Self::NodeFail | Self::Revoked | Self::Unknown => {
                TaskState::Failed(EXIT_SCHEDULER)
            }
        }
    }
}

/// Parses an `ExitCode` field of the form `code:signal`.
///
/// A task terminated by a signal reports `128 +` the signal number.
fn parse_exit_code(s: &str) -> Option<i32> {
    let (code, signal) = s.split_once(':')?;
    let code: i32 = code.parse().ok()?;
    let signal: i32 = signal.parse().ok()?;

    if signal > 0 {
        Some(128 + (signal & 0x7f))
    } else {
        Some(code)
    }
}

/// Parses the task reference of a `sacct`/`squeue` job id column.
///
/// Accepted shapes: `123_4` (one task), `123_[0-7]` or `123_[0-7%2]`
/// (a pending range), and `123` (the whole array before Slurm splits it
/// out). Job steps (`123_4.batch`) yield `None`.
fn parse_task_ids(field: &str, expected_array: u64) -> Option<Vec<u32>> {
    if field.contains('.') {
        return None;
    }

    let (array, tasks) = match field.split_once('_') {
        Some((array, tasks)) => (array, Some(tasks)),
        None => (field, None),
    };

    if array.parse::<u64>().ok()? != expected_array {
        return None;
    }

    match tasks {
        None => Some(Vec::new()),
        Some(tasks) => {
            if let Some(range) = tasks.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                // A throttle suffix (`%N`) may trail the range.
                let range = range.split('%').next().unwrap_or(range);
                let mut ids = Vec::new();
                for part in range.split(',') {
                    match part.split_once('-') {
                        Some((lo, hi)) => {
                            let lo: u32 = lo.parse().ok()?;
                            let hi: u32 = hi.parse().ok()?;
                            ids.extend(lo..=hi);
                        }
                        None => ids.push(part.parse().ok()?),
                    }
                }
                Some(ids)
            } else {
                Some(vec![tasks.parse().ok()?])
            }
        }
    }
}

/// Parses the full `sacct` output for an array job into per-task states.
fn parse_sacct_output(output: &str, array: u64, size: Option<u32>) -> HashMap<u32, TaskState> {
    let mut states = HashMap::new();

    for line in output.lines() {
        let mut parts = line.split('|');
        let (Some(id), Some(state), code) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };

        let Some(task_ids) = parse_task_ids(id, array) else {
            continue;
        };

        // SAFETY: `SlurmState::from_str` is total.
        let state: SlurmState = state.parse().unwrap();
        let exit_code = code.and_then(parse_exit_code);
        let task_state = state.to_task_state(exit_code);

        if task_ids.is_empty() {
            // A bare array id covers every task not split out yet.
            if let Some(size) = size {
                for task in 0..size {
                    states.entry(task).or_insert(task_state);
                }
            }
        } else {
            for task in task_ids {
                states.insert(task, task_state);
            }
        }
    }

    states
}

/// Runs a scheduler command and returns its stdout.
async fn run(command: &mut Command, program: &str) -> Result<String> {
    trace!(?command, "spawning `{program}`");

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SchedulerError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| SchedulerError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SchedulerError::Command {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    String::from_utf8(output.stdout)
        .map_err(|_| SchedulerError::Parse(format!("`{program}` output was not UTF-8")))
}

/// The production Slurm adapter.
#[derive(Debug)]
pub struct SlurmScheduler {
    /// The deadline applied to `sacct` queries.
    query_deadline: Duration,
    /// Array sizes by submitted array id, used to expand bare array rows.
    sizes: tokio::sync::Mutex<HashMap<u64, u32>>,
}

impl SlurmScheduler {
    /// Creates a new Slurm adapter with the default query deadline.
    pub fn new() -> Self {
        Self {
            query_deadline: Duration::from_secs(DEFAULT_QUERY_DEADLINE),
            sizes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Materializes the launcher asset into the run directory.
    async fn ensure_launcher(&self, request: &ArrayRequest) -> Result<std::path::PathBuf> {
        let path = request.run_dir.join(LAUNCHER_FILE);
        if !path.exists() {
            tokio::fs::write(&path, LAUNCHER)
                .await
                .map_err(|source| SchedulerError::Io {
                    path: path.clone(),
                    source,
                })?;

            #[cfg(unix)]
            {
                use std::fs::Permissions;
                use std::os::unix::fs::PermissionsExt as _;

                tokio::fs::set_permissions(&path, Permissions::from_mode(0o755))
                    .await
                    .map_err(|source| SchedulerError::Io {
                        path: path.clone(),
                        source,
                    })?;
            }
        }

        Ok(path)
    }

    /// Writes the bucket's work file and returns its path.
    async fn write_work_file(&self, request: &ArrayRequest) -> Result<std::path::PathBuf> {
        let dir = request.run_dir.join(WORK_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SchedulerError::Io {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(format!("{}-{}.json", request.name, Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(&request.records)
            .map_err(|e| SchedulerError::Parse(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| SchedulerError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit_array(&self, request: &ArrayRequest) -> Result<ArrayJobId> {
        let launcher = self.ensure_launcher(request).await?;
        let work_file = self.write_work_file(request).await?;

        let mut command = Command::new("sbatch");
        command
            .arg("--parsable")
            .arg(format!("--job-name={}", request.name))
            .arg(format!("--array=0-{}", request.array_size().saturating_sub(1)))
            .arg(format!("--chdir={}", request.run_dir.display()))
            // `%A` array job id, `%a` array task id.
            .arg("--output=%A_%a.stdout")
            .arg("--error=%A_%a.stderr")
            .arg("--ntasks=1")
            .arg(format!("--cpus-per-task={}", request.resources.cpus))
            .arg(format!("--time={}", request.resources.time));

        if let Some(memory) = request.resources.memory {
            command.arg(format!("--mem={memory}M"));
        }

        if !request.account.is_empty() {
            command.arg(format!("--account={}", request.account));
        }

        command
            .arg(&launcher)
            .arg(&request.conda_env)
            .arg(&request.script)
            .arg(&work_file);

        let stdout = run(&mut command, "sbatch").await?;

        // `--parsable` prints `<job id>` or `<job id>;<cluster>`.
        let id: ArrayJobId = stdout
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .parse()?;

        self.sizes.lock().await.insert(id.0, request.array_size());

        debug!(
            "bucket `{name}` submitted as Slurm array job `{id}` ({size} tasks)",
            name = request.name,
            size = request.array_size()
        );
        Ok(id)
    }

    async fn query(&self, id: ArrayJobId) -> Result<HashMap<u32, TaskState>> {
        let mut command = Command::new("sacct");
        command
            .arg("-P")
            .arg("-n")
            .arg("--format")
            .arg(SACCT_FIELDS)
            .arg("-j")
            .arg(id.to_string());

        let stdout = tokio::time::timeout(self.query_deadline, run(&mut command, "sacct"))
            .await
            .map_err(|_| SchedulerError::Timeout {
                program: "sacct".to_string(),
                seconds: self.query_deadline.as_secs(),
            })??;

        let size = self.sizes.lock().await.get(&id.0).copied();
        Ok(parse_sacct_output(&stdout, id.0, size))
    }

    async fn cancel(&self, id: ArrayJobId, task_ids: Option<&[u32]>) -> Result<()> {
        let mut command = Command::new("scancel");
        match task_ids {
            Some(tasks) => {
                for task in tasks {
                    command.arg(format!("{id}_{task}"));
                }
            }
            None => {
                command.arg(id.to_string());
            }
        }

        run(&mut command, "scancel").await?;
        Ok(())
    }

    async fn list_active(&self, account: &str, name_prefix: &str) -> Result<Vec<ArrayJobId>> {
        let mut command = Command::new("squeue");
        command.arg("--noheader").arg("-o").arg("%i|%j");
        if !account.is_empty() {
            command.arg(format!("--account={account}"));
        }

        let stdout = run(&mut command, "squeue").await?;

        let mut ids = HashSet::new();
        for line in stdout.lines() {
            let Some((id, name)) = line.trim().split_once('|') else {
                continue;
            };

            if !name_matches(name, name_prefix) {
                continue;
            }

            // `%i` prints `123`, `123_4`, or `123_[0-7]`.
            let base = id.split('_').next().unwrap_or(id);
            if let Ok(base) = base.parse::<u64>() {
                ids.insert(ArrayJobId(base));
            }
        }

        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn exit_code_parsing() {
        assert_eq!(parse_exit_code("0:0"), Some(0));
        assert_eq!(parse_exit_code("2:0"), Some(2));
        // Signal-terminated tasks report 128 + the signal number.
        assert_eq!(parse_exit_code("0:9"), Some(137));
        assert_eq!(parse_exit_code("garbage"), None);
    }

    #[test]
    fn task_id_parsing() {
        assert_eq!(parse_task_ids("123_4", 123), Some(vec![4]));
        assert_eq!(parse_task_ids("123", 123), Some(vec![]));
        assert_eq!(parse_task_ids("123_[0-3]", 123), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_task_ids("123_[0-2%2]", 123), Some(vec![0, 1, 2]));
        assert_eq!(parse_task_ids("123_[0,2-3]", 123), Some(vec![0, 2, 3]));
        // Job steps and foreign jobs are skipped.
        assert_eq!(parse_task_ids("123_4.batch", 123), None);
        assert_eq!(parse_task_ids("999_0", 123), None);
    }

    #[test]
    fn sacct_output_parsing() {
        let output = "\
123_0|COMPLETED|0:0
123_0.batch|COMPLETED|0:0
123_1|RUNNING|0:0
123_2|FAILED|2:0
123_[3-4]|PENDING|0:0
";
        let states = parse_sacct_output(output, 123, Some(5));
        assert_eq!(states[&0], TaskState::Succeeded);
        assert_eq!(states[&1], TaskState::Running);
        assert_eq!(states[&2], TaskState::Failed(2));
        assert_eq!(states[&3], TaskState::Pending);
        assert_eq!(states[&4], TaskState::Pending);
    }

    #[test]
    fn sacct_bare_array_row_covers_all_tasks() {
        // Right after submission `sacct` may report the array as one row.
        let states = parse_sacct_output("123|PENDING|0:0\n", 123, Some(3));
        assert_eq!(states.len(), 3);
        assert_eq!(states[&2], TaskState::Pending);
    }

    #[test]
    fn scheduler_side_states_get_synthetic_exit_codes() {
        let states = parse_sacct_output(
            "9_0|TIMEOUT|0:0\n9_1|OUT_OF_MEMORY|0:125\n9_2|CANCELLED by 1000|0:15\n9_3|NODE_FAIL|0:0\n",
            9,
            Some(4),
        );
        assert_eq!(states[&0], TaskState::Failed(EXIT_TIMEOUT));
        assert_eq!(states[&1], TaskState::Failed(EXIT_OOM));
        assert_eq!(states[&2], TaskState::Failed(EXIT_CANCELLED));
        assert_eq!(states[&3], TaskState::Failed(EXIT_SCHEDULER));
    }

    #[test]
    fn unknown_states_are_failures() {
        let states = parse_sacct_output("9_0|SPECIAL_EXIT|0:0\n", 9, Some(1));
        assert_eq!(states[&0], TaskState::Failed(EXIT_SCHEDULER));
    }
}
