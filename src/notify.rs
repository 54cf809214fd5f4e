//! Human-visible pipeline event notifications.
//!
//! The notifier is a one-way sink: failures inside an implementation are
//! logged and dropped, never propagated into the control loop. The Slack
//! transport itself is an external collaborator; the production
//! implementation here writes the same events to the process log, which a
//! sidecar can forward using the configured `slack` properties.

use async_trait::async_trait;
use tracing::error;
use tracing::info;

use crate::store::StateCounts;

/// Per-job results reported at pipeline completion.
#[derive(Debug, Clone)]
pub struct JobSummary {
    /// The job name.
    pub name: String,
    /// The final package counts.
    pub counts: StateCounts,
    /// Whether the job failed before submission (parameter expansion).
    pub expansion_failed: bool,
}

/// The end-of-run report.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    /// Per-job results, in execution order.
    pub jobs: Vec<JobSummary>,
    /// Whether the run was aborted.
    pub aborted: bool,
}

impl PipelineSummary {
    /// Tallies the total package counts across all jobs.
    pub fn totals(&self) -> StateCounts {
        let mut totals = StateCounts::default();
        for job in &self.jobs {
            totals.pending += job.counts.pending;
            totals.running += job.counts.running;
            totals.succeeded += job.counts.succeeded;
            totals.failed += job.counts.failed;
            totals.cancelled += job.counts.cancelled;
        }

        totals
    }
}

/// A one-way sink for human-visible pipeline events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The pipeline has started with the given jobs.
    async fn pipeline_started(&self, jobs: &[String]);

    /// A job has started with the given number of work packages.
    async fn job_started(&self, name: &str, total: usize);

    /// A job has settled with the given counts.
    async fn job_completed(&self, name: &str, counts: &StateCounts);

    /// The pipeline has finished.
    async fn pipeline_completed(&self, summary: &PipelineSummary);

    /// Something went wrong that an operator should see.
    async fn error(&self, message: &str);
}

/// A notifier that writes events to the process log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn pipeline_started(&self, jobs: &[String]) {
        info!("pipeline started: {}", jobs.join(" -> "));
    }

    async fn job_started(&self, name: &str, total: usize) {
        info!("job `{name}` started with {total} work packages");
    }

    async fn job_completed(&self, name: &str, counts: &StateCounts) {
        info!(
            "job `{name}` completed: {succeeded} of {total} work packages succeeded ({counts})",
            succeeded = counts.succeeded,
            total = counts.total(),
        );
    }

    async fn pipeline_completed(&self, summary: &PipelineSummary) {
        let totals = summary.totals();
        if summary.aborted {
            info!("pipeline aborted ({totals})");
        } else {
            info!(
                "pipeline finished: {succeeded} of {total} work packages succeeded",
                succeeded = totals.succeeded,
                total = totals.total(),
            );
        }
    }

    async fn error(&self, message: &str) {
        error!("{message}");
    }
}
