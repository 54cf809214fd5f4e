//! Models that back work-package store entries.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::config::Resources;

/// The lifecycle state of a work package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    /// The package has not been submitted, or is queued for resubmission
    /// after a retryable failure (`attempt >= 1`).
    Pending,
    /// The package was handed to the scheduler and has an external id.
    Submitted,
    /// The scheduler reported the package's task as running.
    Running,
    /// The task exited successfully.
    Succeeded,
    /// The task failed and its retry budget is exhausted.
    Failed,
    /// The package was cancelled by an abort.
    Cancelled,
}

impl WorkState {
    /// Determines whether the state is terminal.
    ///
    /// Terminal states are never transitioned out of within a single
    /// pipeline run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Determines whether the package currently occupies the scheduler.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkState::Pending => write!(f, "pending"),
            WorkState::Submitted => write!(f, "submitted"),
            WorkState::Running => write!(f, "running"),
            WorkState::Succeeded => write!(f, "succeeded"),
            WorkState::Failed => write!(f, "failed"),
            WorkState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkState::Pending),
            "submitted" => Ok(WorkState::Submitted),
            "running" => Ok(WorkState::Running),
            "succeeded" => Ok(WorkState::Succeeded),
            "failed" => Ok(WorkState::Failed),
            "cancelled" => Ok(WorkState::Cancelled),
            _ => Err(format!("invalid work state: {s}")),
        }
    }
}

/// The scheduler-side identity of a submitted work package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId {
    /// The array job the package was submitted under.
    pub array_job_id: u64,
    /// The package's task index within the array.
    pub task_id: u32,
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.array_job_id, self.task_id)
    }
}

impl FromStr for ExternalId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (array, task) = s
            .split_once('_')
            .ok_or_else(|| format!("invalid external id: {s}"))?;

        Ok(Self {
            array_job_id: array
                .parse()
                .map_err(|_| format!("invalid array job id: {array}"))?,
            task_id: task.parse().map_err(|_| format!("invalid task id: {task}"))?,
        })
    }
}

/// The failure details captured for a work package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkError {
    /// The scheduler-reported exit code, if any.
    pub exit_code: Option<i32>,
    /// A description of the failure.
    pub message: String,
    /// The tail of the captured stderr log, if one was readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

/// The atomic unit of pipeline work: one invocation of the user script with
/// one parameter record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPackage {
    /// The bucket-qualified job name (`job` or `job.suffix`).
    pub job_name: String,
    /// The position within the bucket's array, dense from 0.
    pub index: u32,
    /// The opaque parameter record piped to the user script.
    pub params: Value,
    /// The effective resource request after special-case resolution.
    pub resources: Resources,
    /// The lifecycle state.
    pub state: WorkState,
    /// The number of submission attempts so far.
    pub attempt: u32,
    /// The current scheduler identity, if submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalId>,
    /// Scheduler identities from earlier attempts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_external: Vec<ExternalId>,
    /// The derived stdout log location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_log: Option<PathBuf>,
    /// The derived stderr log location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_log: Option<PathBuf>,
    /// The most recent failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WorkError>,
    /// When the package was created.
    pub created_at: DateTime<Utc>,
    /// When the package last changed.
    pub updated_at: DateTime<Utc>,
}

impl WorkPackage {
    /// Creates a new pending work package.
    pub fn new(job_name: String, index: u32, params: Value, resources: Resources) -> Self {
        let now = Utc::now();
        Self {
            job_name,
            index,
            params,
            resources,
            state: WorkState::Pending,
            attempt: 0,
            external: None,
            prior_external: Vec::new(),
            stdout_log: None,
            stderr_log: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Gets the unique `(job_name, index)` key of the package.
    pub fn key(&self) -> (String, u32) {
        (self.job_name.clone(), self.index)
    }

    /// Gets the base job name with any special-case suffix removed.
    pub fn base_job(&self) -> &str {
        self.job_name
            .split_once('.')
            .map(|(base, _)| base)
            .unwrap_or(&self.job_name)
    }

    /// Determines whether the package is queued for a retry submission.
    pub fn is_retryable(&self) -> bool {
        self.state == WorkState::Pending && self.attempt >= 1
    }

    /// Records a successful submission.
    pub fn mark_submitted(&mut self, external: ExternalId, stdout_log: PathBuf, stderr_log: PathBuf) {
        self.attempt += 1;
        self.external = Some(external);
        self.stdout_log = Some(stdout_log);
        self.stderr_log = Some(stderr_log);
        self.transition(WorkState::Submitted);
    }

    /// Records that the scheduler observed the task running.
    pub fn mark_running(&mut self) {
        self.transition(WorkState::Running);
    }

    /// Records a successful completion.
    pub fn mark_succeeded(&mut self) {
        self.transition(WorkState::Succeeded);
    }

    /// Records a failure whose retry budget is exhausted.
    pub fn mark_failed(&mut self, error: WorkError) {
        self.last_error = Some(error);
        self.transition(WorkState::Failed);
    }

    /// Records a retryable failure: the package returns to the queue and
    /// its scheduler identity is retired.
    pub fn mark_retryable(&mut self, error: WorkError) {
        self.last_error = Some(error);
        if let Some(external) = self.external.take() {
            self.prior_external.push(external);
        }
        self.transition(WorkState::Pending);
    }

    /// Records cancellation by an abort.
    pub fn mark_cancelled(&mut self) {
        self.transition(WorkState::Cancelled);
    }

    /// Returns a terminally failed package to the queue with a fresh retry
    /// budget, preserving its bucket assignment. Used by `retry`.
    pub fn reset_for_retry(&mut self) {
        self.attempt = 0;
        if let Some(external) = self.external.take() {
            self.prior_external.push(external);
        }
        self.transition(WorkState::Pending);
    }

    /// Applies a state transition and stamps the update time.
    fn transition(&mut self, state: WorkState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Per-state package counts for a job, as surfaced to operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Packages waiting for (re)submission.
    pub pending: u32,
    /// Packages submitted or observed running.
    pub running: u32,
    /// Packages that succeeded.
    pub succeeded: u32,
    /// Packages that failed terminally.
    pub failed: u32,
    /// Packages cancelled by an abort.
    pub cancelled: u32,
}

impl StateCounts {
    /// Tallies the given packages.
    pub fn tally<'a>(packages: impl IntoIterator<Item = &'a WorkPackage>) -> Self {
        let mut counts = Self::default();
        for package in packages {
            match package.state {
                WorkState::Pending => counts.pending += 1,
                WorkState::Submitted | WorkState::Running => counts.running += 1,
                WorkState::Succeeded => counts.succeeded += 1,
                WorkState::Failed => counts.failed += 1,
                WorkState::Cancelled => counts.cancelled += 1,
            }
        }

        counts
    }

    /// Gets the total number of packages tallied.
    pub fn total(&self) -> u32 {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}

impl fmt::Display for StateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending: {}, running: {}, succeeded: {}, failed: {}, cancelled: {}",
            self.pending, self.running, self.succeeded, self.failed, self.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::TimeLimit;

    /// Builds a small resource request.
    fn resources() -> Resources {
        Resources {
            cpus: 1,
            time: TimeLimit::try_from("00:10:00".to_string()).unwrap(),
            memory: None,
        }
    }

    #[test]
    fn external_id_round_trips() {
        let id = ExternalId {
            array_job_id: 4217,
            task_id: 12,
        };
        assert_eq!(id.to_string(), "4217_12");
        assert_eq!("4217_12".parse::<ExternalId>().unwrap(), id);
        assert!("4217".parse::<ExternalId>().is_err());
    }

    #[test]
    fn base_job_strips_suffix() {
        let wp = WorkPackage::new(
            "feature-engineering.small-cities".to_string(),
            0,
            json!({}),
            resources(),
        );
        assert_eq!(wp.base_job(), "feature-engineering");

        let wp = WorkPackage::new("feature-engineering".to_string(), 0, json!({}), resources());
        assert_eq!(wp.base_job(), "feature-engineering");
    }

    #[test]
    fn retryable_failure_retires_external_id() {
        let mut wp = WorkPackage::new("j".to_string(), 0, json!({}), resources());
        let first = ExternalId {
            array_job_id: 1,
            task_id: 0,
        };
        wp.mark_submitted(first, "1.stdout".into(), "1.stderr".into());
        assert_eq!(wp.attempt, 1);
        assert_eq!(wp.state, WorkState::Submitted);

        wp.mark_retryable(WorkError {
            exit_code: Some(1),
            message: "task failed".to_string(),
            stderr_tail: None,
        });
        assert!(wp.is_retryable());
        assert_eq!(wp.external, None);
        assert_eq!(wp.prior_external, vec![first]);
    }

    #[test]
    fn tally_groups_in_flight_states() {
        let mut submitted = WorkPackage::new("j".to_string(), 0, json!({}), resources());
        submitted.mark_submitted(
            ExternalId {
                array_job_id: 1,
                task_id: 0,
            },
            "1.stdout".into(),
            "1.stderr".into(),
        );
        let mut running = WorkPackage::new("j".to_string(), 1, json!({}), resources());
        running.mark_running();
        let pending = WorkPackage::new("j".to_string(), 2, json!({}), resources());

        let counts = StateCounts::tally([&submitted, &running, &pending]);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 2);
        assert_eq!(counts.total(), 3);
    }
}
