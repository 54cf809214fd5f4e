//! The pipeline supervisor.
//!
//! The supervisor is the long-running control loop that advances a
//! pipeline job by job: it expands parameters into work packages,
//! partitions them into resource buckets, submits each bucket as an array
//! job, polls the scheduler for task states, retries transient failures
//! with exponential backoff, and persists every transition to the store.
//!
//! It is an explicitly constructed instance holding its collaborators as
//! dependencies; state transitions are applied only from this task, so the
//! store has exactly one writer.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use thiserror::Error;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bucket;
use crate::config::JobConfig;
use crate::config::PipelineConfig;
use crate::config::Properties;
use crate::config::Resources;
use crate::notify::JobSummary;
use crate::notify::Notifier;
use crate::notify::PipelineSummary;
use crate::params;
use crate::scheduler::ArrayJobId;
use crate::scheduler::ArrayRequest;
use crate::scheduler::Scheduler;
use crate::scheduler::TaskState;
use crate::scheduler::stderr_log;
use crate::scheduler::stdout_log;
use crate::store::ExternalId;
use crate::store::RunLayout;
use crate::store::StateCounts;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::WorkError;
use crate::store::WorkPackage;
use crate::utils::format_duration;
use crate::utils::read_tail;

/// The number of submission attempts for one bucket before its packages
/// are failed.
const SUBMIT_ATTEMPTS: u32 = 3;

/// The fixed delay between bucket submission attempts.
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The number of consecutive polls a submitted task may go unreported
/// before it is treated as forgotten by the scheduler.
const MISSING_POLLS_TOLERATED: u32 = 3;

/// The synthetic exit code for tasks the scheduler has forgotten.
const EXIT_FORGOTTEN: i32 = -1;

/// How many trailing bytes of a task's stderr log are captured on failure.
const STDERR_TAIL_BYTES: u64 = 2048;

/// A status line is logged every this many polls.
const STATUS_POLL_CADENCE: u64 = 25;

/// Supervisor errors.
///
/// Only store writes are fatal here: the supervisor stops rather than let
/// its memory and the durable record diverge. Scheduler hiccups are
/// handled in place by the retry policy.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a supervised pipeline run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Every package reached a terminal state (failures included).
    Completed(PipelineSummary),
    /// The run was aborted before settling.
    Aborted(PipelineSummary),
}

/// How a single job ended.
enum JobRun {
    /// All packages are terminal.
    Settled(StateCounts),
    /// Parameter expansion failed; no packages were created.
    ExpansionFailed(String),
    /// The abort signal arrived while the job was in flight.
    Aborted(StateCounts),
}

/// A group of retryable packages awaiting resubmission as a fresh array.
struct RetryBatch {
    /// The bucket name the packages belong to.
    bucket: String,
    /// The bucket's resource request.
    resources: Resources,
    /// The member package keys, in index order.
    keys: Vec<(String, u32)>,
    /// When the batch may be submitted.
    ready_at: Instant,
}

/// The pipeline supervisor.
#[allow(missing_debug_implementations)]
pub struct Supervisor {
    /// The process-wide pipeline settings.
    properties: Properties,
    /// The durable work-package store.
    store: Arc<dyn Store>,
    /// The workload-manager adapter.
    scheduler: Arc<dyn Scheduler>,
    /// The human-visible event sink.
    notifier: Arc<dyn Notifier>,
    /// Trips on abort; every suspension point selects on it.
    token: CancellationToken,
}

impl Supervisor {
    /// Creates a new supervisor over the given collaborators.
    pub fn new(
        properties: Properties,
        store: Arc<dyn Store>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            properties,
            store,
            scheduler,
            notifier,
            token: CancellationToken::new(),
        }
    }

    /// Gets a handle that aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Drives the pipeline to completion.
    ///
    /// Jobs execute strictly in config order; the pipeline advances past a
    /// job only once every one of its packages is terminal. A job that
    /// settles with failures does not stop the pipeline unless
    /// `halt_on_failure` is set.
    pub async fn run(
        &self,
        config: &PipelineConfig,
        layout: &RunLayout,
    ) -> Result<Outcome, SupervisorError> {
        let names: Vec<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
        self.notifier.pipeline_started(&names).await;

        let mut summary = PipelineSummary::default();
        let mut aborted = false;

        for job in &config.jobs {
            if self.token.is_cancelled() {
                aborted = true;
                break;
            }

            match self.run_job(job, layout).await? {
                JobRun::Settled(counts) => {
                    self.notifier.job_completed(&job.name, &counts).await;
                    summary.jobs.push(JobSummary {
                        name: job.name.clone(),
                        counts,
                        expansion_failed: false,
                    });

                    if self.properties.halt_on_failure && counts.failed > 0 {
                        self.notifier
                            .error(&format!(
                                "job `{}` settled with {} failed work packages; halting pipeline",
                                job.name, counts.failed
                            ))
                            .await;
                        break;
                    }
                }
                JobRun::ExpansionFailed(message) => {
                    self.notifier
                        .error(&format!("job `{}` failed to expand: {message}", job.name))
                        .await;
                    summary.jobs.push(JobSummary {
                        name: job.name.clone(),
                        counts: StateCounts::default(),
                        expansion_failed: true,
                    });
                }
                JobRun::Aborted(counts) => {
                    summary.jobs.push(JobSummary {
                        name: job.name.clone(),
                        counts,
                        expansion_failed: false,
                    });
                    aborted = true;
                    break;
                }
            }
        }

        summary.aborted = aborted;
        self.notifier.pipeline_completed(&summary).await;

        if aborted {
            Ok(Outcome::Aborted(summary))
        } else {
            Ok(Outcome::Completed(summary))
        }
    }

    /// Drives a single job until every package is terminal.
    async fn run_job(
        &self,
        job: &JobConfig,
        layout: &RunLayout,
    ) -> Result<JobRun, SupervisorError> {
        // SAFETY: the layout was built from the same config.
        let run_dir = layout.job_dir(&job.name).expect("job has a run directory");

        let mut packages: BTreeMap<(String, u32), WorkPackage> = self
            .store
            .job(&job.name)
            .await?
            .into_iter()
            .map(|wp| (wp.key(), wp))
            .collect();

        if packages.is_empty() {
            // First encounter: expand and partition, then persist the
            // whole set before anything is submitted.
            let records = match params::expand(job) {
                Ok(records) => records,
                Err(e) => return Ok(JobRun::ExpansionFailed(e.to_string())),
            };

            let (buckets, _warnings) = bucket::partition(job, &records);
            for bucket in &buckets {
                for (index, record) in bucket.records.iter().enumerate() {
                    let wp = WorkPackage::new(
                        bucket.name.clone(),
                        index as u32,
                        record.clone(),
                        bucket.resources.clone(),
                    );
                    self.store.upsert(&wp).await?;
                    packages.insert(wp.key(), wp);
                }
            }

            self.notifier.job_started(&job.name, packages.len()).await;
        } else {
            if packages.values().all(|wp| wp.state.is_terminal()) {
                debug!("job `{}` already settled; skipping", job.name);
                return Ok(JobRun::Settled(StateCounts::tally(packages.values())));
            }

            info!(
                "resuming job `{}` with {} work packages from the store",
                job.name,
                packages.len()
            );
            self.reconcile(job, &mut packages).await?;
        }

        // Initial submissions: every pending package, grouped by bucket.
        // On a resume this also covers retryable packages whose backoff
        // window died with the previous process.
        let mut batches = pending_batches(&packages, Instant::now());
        let mut queued: HashSet<(String, u32)> = batches
            .iter()
            .flat_map(|batch| batch.keys.iter().cloned())
            .collect();
        // Tasks that stopped being reported by the scheduler, by key.
        let mut missing_polls: HashMap<(String, u32), u32> = HashMap::new();

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.properties.poll_interval));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();
        let mut polls: u64 = 0;

        loop {
            // Submit whatever is due before sleeping.
            let now = Instant::now();
            let mut due = Vec::new();
            batches.retain(|batch| {
                if batch.ready_at <= now {
                    due.push(RetryBatch {
                        bucket: batch.bucket.clone(),
                        resources: batch.resources.clone(),
                        keys: batch.keys.clone(),
                        ready_at: batch.ready_at,
                    });
                    false
                } else {
                    true
                }
            });

            for batch in due {
                for key in &batch.keys {
                    queued.remove(key);
                }
                if self.token.is_cancelled() {
                    break;
                }
                self.submit_bucket(job, run_dir, &batch, &mut packages)
                    .await?;
            }

            if packages.values().all(|wp| wp.state.is_terminal()) {
                return Ok(JobRun::Settled(StateCounts::tally(packages.values())));
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    return Ok(JobRun::Aborted(self.abort_job(&job.name, &mut packages).await?));
                }
                _ = interval.tick() => {}
            }
            polls += 1;

            // Query the outstanding arrays concurrently, then apply the
            // observed states from this single task.
            let arrays = in_flight_arrays(&packages);
            let results = future::join_all(
                arrays
                    .keys()
                    .map(|array_job_id| self.scheduler.query(ArrayJobId(*array_job_id))),
            )
            .await;

            for ((array_job_id, keys), result) in arrays.into_iter().zip(results) {
                let states = match result {
                    Ok(states) => states,
                    Err(e) => {
                        // No information; re-query on the next tick.
                        debug!("query for array `{array_job_id}` gave no information: {e}");
                        continue;
                    }
                };

                for key in keys {
                    // SAFETY: keys were collected from this map above.
                    let wp = packages.get_mut(&key).unwrap();
                    // SAFETY: in-flight packages always carry an id.
                    let task_id = wp.external.unwrap().task_id;

                    match states.get(&task_id) {
                        Some(state) => {
                            missing_polls.remove(&key);
                            self.observe(wp, *state).await?;
                        }
                        None => {
                            // The scheduler stopped reporting the task.
                            let misses = missing_polls.entry(key.clone()).or_insert(0);
                            *misses += 1;
                            if *misses >= MISSING_POLLS_TOLERATED {
                                missing_polls.remove(&key);
                                warn!(
                                    "task `{external}` of `{bucket}` is no longer reported; \
                                     treating as failed",
                                    external = wp.external.unwrap(),
                                    bucket = wp.job_name,
                                );
                                self.fail_or_retry(
                                    wp,
                                    WorkError {
                                        exit_code: Some(EXIT_FORGOTTEN),
                                        message: "task disappeared from the scheduler".to_string(),
                                        stderr_tail: None,
                                    },
                                )
                                .await?;
                            }
                        }
                    }
                }
            }

            // Buckets with nothing left in flight release their retryable
            // packages into fresh retry batches, delayed by the backoff.
            self.collect_retry_batches(&packages, &mut batches, &mut queued);

            if polls % STATUS_POLL_CADENCE == 0 {
                let counts = StateCounts::tally(packages.values());
                info!(
                    "job `{name}` status after {elapsed}: {counts}",
                    name = job.name,
                    elapsed = format_duration(started.elapsed().as_secs()),
                );
            }
        }
    }

    /// Reconciles stored in-flight packages against the scheduler after a
    /// restart.
    ///
    /// Packages whose array the scheduler still lists stay as they are and
    /// resume polling. Dead arrays are queried once for their terminal
    /// states; tasks the scheduler has forgotten entirely fail with a
    /// synthetic exit code and flow through the normal retry policy.
    async fn reconcile(
        &self,
        job: &JobConfig,
        packages: &mut BTreeMap<(String, u32), WorkPackage>,
    ) -> Result<(), SupervisorError> {
        let arrays = in_flight_arrays(packages);
        if arrays.is_empty() {
            return Ok(());
        }

        let live: HashSet<u64> = match self
            .scheduler
            .list_active(&self.properties.account, &job.name)
            .await
        {
            Ok(ids) => ids.into_iter().map(|id| id.0).collect(),
            Err(e) => {
                // Without discovery there is no safe verdict; keep
                // everything and let the poll loop sort it out.
                warn!("restart reconciliation could not list active arrays: {e}");
                return Ok(());
            }
        };

        for (array_job_id, keys) in arrays {
            if live.contains(&array_job_id) {
                debug!("array `{array_job_id}` is still active; resuming polling");
                continue;
            }

            let states = match self.scheduler.query(ArrayJobId(array_job_id)).await {
                Ok(states) => states,
                Err(e) => {
                    warn!("could not query dead array `{array_job_id}`: {e}");
                    continue;
                }
            };

            for key in keys {
                // SAFETY: keys were collected from this map above.
                let wp = packages.get_mut(&key).unwrap();
                // SAFETY: in-flight packages always carry an id.
                let task_id = wp.external.unwrap().task_id;

                match states.get(&task_id) {
                    Some(state) => self.observe(wp, *state).await?,
                    None => {
                        self.fail_or_retry(
                            wp,
                            WorkError {
                                exit_code: Some(EXIT_FORGOTTEN),
                                message: "scheduler no longer knows this task".to_string(),
                                stderr_tail: None,
                            },
                        )
                        .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Submits one batch of packages as a fresh array job.
    ///
    /// Submission is retried a fixed number of times; once exhausted, the
    /// whole batch is failed.
    async fn submit_bucket(
        &self,
        job: &JobConfig,
        run_dir: &std::path::Path,
        batch: &RetryBatch,
        packages: &mut BTreeMap<(String, u32), WorkPackage>,
    ) -> Result<(), SupervisorError> {
        let records: Vec<serde_json::Value> = batch
            .keys
            .iter()
            .map(|key| packages[key].params.clone())
            .collect();

        let request = ArrayRequest {
            name: batch.bucket.clone(),
            script: job.script.clone(),
            conda_env: self.properties.conda_env.clone(),
            account: self.properties.account.clone(),
            resources: batch.resources.clone(),
            records,
            run_dir: run_dir.to_path_buf(),
        };

        debug!(
            "submitting {count} work packages for bucket `{bucket}` ({cpus} cpus, {time})",
            count = batch.keys.len(),
            bucket = batch.bucket,
            cpus = batch.resources.cpus,
            time = batch.resources.time,
        );

        let mut failure = None;
        for submit_attempt in 1..=SUBMIT_ATTEMPTS {
            match self.scheduler.submit_array(&request).await {
                Ok(id) => {
                    for (task_id, key) in batch.keys.iter().enumerate() {
                        // SAFETY: batch keys come from this map.
                        let wp = packages.get_mut(key).unwrap();
                        let external = ExternalId {
                            array_job_id: id.0,
                            task_id: task_id as u32,
                        };
                        wp.mark_submitted(
                            external,
                            stdout_log(run_dir, external),
                            stderr_log(run_dir, external),
                        );
                        self.store.upsert(wp).await?;
                    }

                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "submission {submit_attempt}/{SUBMIT_ATTEMPTS} of bucket `{bucket}` \
                         failed: {e}",
                        bucket = batch.bucket,
                    );
                    failure = Some(e.to_string());

                    if submit_attempt < SUBMIT_ATTEMPTS {
                        tokio::select! {
                            _ = self.token.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(SUBMIT_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }

        // SAFETY: the loop above ran at least once and failed.
        let message = failure.unwrap();
        self.notifier
            .error(&format!(
                "bucket `{bucket}` could not be submitted: {message}",
                bucket = batch.bucket
            ))
            .await;
        for key in &batch.keys {
            // SAFETY: batch keys come from this map.
            let wp = packages.get_mut(key).unwrap();
            wp.mark_failed(WorkError {
                exit_code: None,
                message: message.clone(),
                stderr_tail: None,
            });
            self.store.upsert(wp).await?;
        }

        Ok(())
    }

    /// Applies one observed task state to a package.
    async fn observe(&self, wp: &mut WorkPackage, state: TaskState) -> Result<(), SupervisorError> {
        if wp.state.is_terminal() {
            return Ok(());
        }

        match state {
            TaskState::Pending => Ok(()),
            TaskState::Running => {
                if wp.state == crate::store::WorkState::Submitted {
                    wp.mark_running();
                    self.store.upsert(wp).await?;
                }
                Ok(())
            }
            TaskState::Succeeded => {
                debug!(
                    "task `{external}` of `{bucket}` succeeded",
                    external = wp.external.map(|e| e.to_string()).unwrap_or_default(),
                    bucket = wp.job_name,
                );
                wp.mark_succeeded();
                self.store.upsert(wp).await?;
                Ok(())
            }
            TaskState::Failed(exit_code) => {
                let stderr_tail = match &wp.stderr_log {
                    Some(path) => read_tail(path, STDERR_TAIL_BYTES).await,
                    None => None,
                };

                self.fail_or_retry(
                    wp,
                    WorkError {
                        exit_code: Some(exit_code),
                        message: format!("task exited with code {exit_code}"),
                        stderr_tail,
                    },
                )
                .await
            }
        }
    }

    /// Fails a package, or requeues it when retry budget remains.
    async fn fail_or_retry(
        &self,
        wp: &mut WorkPackage,
        error: WorkError,
    ) -> Result<(), SupervisorError> {
        if wp.attempt <= self.properties.max_retries {
            debug!(
                "package `{bucket}[{index}]` failed on attempt {attempt}; will retry",
                bucket = wp.job_name,
                index = wp.index,
                attempt = wp.attempt,
            );
            wp.mark_retryable(error);
        } else {
            warn!(
                "package `{bucket}[{index}]` failed after {attempt} attempts; giving up: \
                 {message}",
                bucket = wp.job_name,
                index = wp.index,
                attempt = wp.attempt,
                message = error.message,
            );
            wp.mark_failed(error);
        }

        self.store.upsert(wp).await?;
        Ok(())
    }

    /// Groups the retryable packages of settled buckets into delayed retry
    /// batches.
    ///
    /// A bucket releases its retryables only once none of its packages are
    /// in flight. Packages are grouped by attempt count so each batch gets
    /// a uniform backoff delay of
    /// `poll_interval * exp_backoff_factor^(attempt - 1)` seconds.
    fn collect_retry_batches(
        &self,
        packages: &BTreeMap<(String, u32), WorkPackage>,
        batches: &mut Vec<RetryBatch>,
        queued: &mut HashSet<(String, u32)>,
    ) {
        let settled: HashSet<&str> = {
            let mut in_flight: HashSet<&str> = HashSet::new();
            for wp in packages.values() {
                if wp.state.is_in_flight() {
                    in_flight.insert(wp.job_name.as_str());
                }
            }

            packages
                .values()
                .map(|wp| wp.job_name.as_str())
                .filter(|bucket| !in_flight.contains(bucket))
                .collect()
        };

        let mut groups: BTreeMap<(String, u32), Vec<(String, u32)>> = BTreeMap::new();
        for wp in packages.values() {
            if wp.is_retryable()
                && settled.contains(wp.job_name.as_str())
                && !queued.contains(&wp.key())
            {
                groups
                    .entry((wp.job_name.clone(), wp.attempt))
                    .or_default()
                    .push(wp.key());
            }
        }

        for ((bucket, attempt), keys) in groups {
            let delay = self.backoff_delay(attempt);
            info!(
                "requeueing {count} work packages of `{bucket}` (attempt {next}) in {delay:?}",
                count = keys.len(),
                next = attempt + 1,
            );

            queued.extend(keys.iter().cloned());
            // SAFETY: groups are keyed by buckets present in the map.
            let resources = packages[&keys[0]].resources.clone();
            batches.push(RetryBatch {
                bucket,
                resources,
                keys,
                ready_at: Instant::now() + delay,
            });
        }
    }

    /// Computes the backoff delay before resubmitting packages that have
    /// completed `attempt` attempts.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .properties
            .exp_backoff_factor
            .powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.properties.poll_interval as f64 * factor)
    }

    /// Cancels everything outstanding and marks non-terminal packages
    /// cancelled.
    ///
    /// Terminal packages are not touched.
    async fn abort_job(
        &self,
        job: &str,
        packages: &mut BTreeMap<(String, u32), WorkPackage>,
    ) -> Result<StateCounts, SupervisorError> {
        info!("abort requested; cancelling outstanding arrays of job `{job}`");

        let arrays: BTreeSet<u64> = packages
            .values()
            .filter(|wp| wp.state.is_in_flight())
            .filter_map(|wp| wp.external.map(|e| e.array_job_id))
            .collect();

        for array_job_id in arrays {
            if let Err(e) = self.scheduler.cancel(ArrayJobId(array_job_id), None).await {
                warn!("failed to cancel array `{array_job_id}`: {e}");
            }
        }

        for wp in packages.values_mut() {
            if !wp.state.is_terminal() {
                wp.mark_cancelled();
                self.store.upsert(wp).await?;
            }
        }

        Ok(StateCounts::tally(packages.values()))
    }
}

/// Groups the in-flight packages by their array job id.
fn in_flight_arrays(
    packages: &BTreeMap<(String, u32), WorkPackage>,
) -> BTreeMap<u64, Vec<(String, u32)>> {
    let mut arrays: BTreeMap<u64, Vec<(String, u32)>> = BTreeMap::new();
    for wp in packages.values() {
        if wp.state.is_in_flight()
            && let Some(external) = wp.external
        {
            arrays.entry(external.array_job_id).or_default().push(wp.key());
        }
    }

    arrays
}

/// Builds immediate submission batches for every pending package, grouped
/// by bucket.
fn pending_batches(
    packages: &BTreeMap<(String, u32), WorkPackage>,
    ready_at: Instant,
) -> Vec<RetryBatch> {
    let mut groups: BTreeMap<String, Vec<(String, u32)>> = BTreeMap::new();
    for wp in packages.values() {
        if wp.state == crate::store::WorkState::Pending {
            groups.entry(wp.job_name.clone()).or_default().push(wp.key());
        }
    }

    groups
        .into_iter()
        .map(|(bucket, keys)| {
            // SAFETY: groups are keyed by buckets present in the map.
            let resources = packages[&keys[0]].resources.clone();
            RetryBatch {
                bucket,
                resources,
                keys,
                ready_at,
            }
        })
        .collect()
}
