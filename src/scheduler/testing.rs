//! An in-memory scheduler for tests.
//!
//! The virtual scheduler scripts task outcomes per parameter record and
//! simulates the pending → running → terminal progression over query
//! rounds, while recording every submission and cancellation so tests can
//! assert on the supervisor's interactions.

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::ArrayJobId;
use super::ArrayRequest;
use super::Result;
use super::Scheduler;
use super::SchedulerError;
use super::TaskState;
use super::name_matches;
use crate::config::Resources;

/// The exit code simulated for cancelled tasks.
const EXIT_CANCELLED: i32 = 130;

/// The scripted outcome of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The attempt succeeds.
    Succeed,
    /// The attempt fails with the given exit code.
    Fail(i32),
}

impl TaskOutcome {
    /// Converts the outcome into the observed terminal task state.
    fn to_task_state(self) -> TaskState {
        match self {
            Self::Succeed => TaskState::Succeeded,
            Self::Fail(code) => TaskState::Failed(code),
        }
    }
}

/// A recorded array submission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The assigned array job id.
    pub id: ArrayJobId,
    /// The bucket name.
    pub name: String,
    /// The resource request.
    pub resources: Resources,
    /// The submitted records, in task order.
    pub records: Vec<Value>,
    /// When the submission happened.
    pub at: Instant,
}

/// One simulated array task.
#[derive(Debug)]
struct VirtualTask {
    /// The scripted terminal outcome.
    outcome: TaskOutcome,
    /// The query round on which the outcome is reported.
    finish_after: u32,
}

/// One simulated array job.
#[derive(Debug)]
struct VirtualArray {
    /// The scheduler-level job name.
    name: String,
    /// The simulated tasks, by task id.
    tasks: Vec<VirtualTask>,
    /// How many times the array has been queried.
    polls: u32,
    /// Whether the array was cancelled.
    cancelled: bool,
}

/// The mutable state behind a [`VirtualScheduler`].
#[derive(Debug, Default)]
struct Inner {
    /// The next array job id to assign.
    next_id: u64,
    /// All known arrays by id.
    arrays: HashMap<u64, VirtualArray>,
    /// Scripted outcome queues keyed by serialized record.
    outcomes: HashMap<String, VecDeque<TaskOutcome>>,
    /// Per-record query rounds until termination, keyed by serialized
    /// record.
    durations: HashMap<String, u32>,
    /// Every submission, in order.
    submissions: Vec<Submission>,
    /// Every cancellation, in order.
    cancellations: Vec<(ArrayJobId, Option<Vec<u32>>)>,
    /// The number of upcoming queries that fail with a timeout.
    failing_queries: u32,
}

impl Inner {
    /// Builds the simulated tasks for a set of records, consuming the
    /// scripted outcomes.
    fn build_tasks(&mut self, records: &[Value], default_finish: u32) -> Vec<VirtualTask> {
        records
            .iter()
            .map(|record| {
                let key = record.to_string();
                VirtualTask {
                    outcome: self
                        .outcomes
                        .get_mut(&key)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or(TaskOutcome::Succeed),
                    finish_after: self.durations.get(&key).copied().unwrap_or(default_finish),
                }
            })
            .collect()
    }
}

/// The in-memory test scheduler.
#[derive(Debug)]
pub struct VirtualScheduler {
    /// The number of queries after which a task reports its terminal
    /// outcome; earlier queries report it running.
    polls_to_finish: u32,
    /// The scheduler state.
    inner: Mutex<Inner>,
}

impl VirtualScheduler {
    /// Creates a scheduler whose tasks run for one query round and
    /// terminate on the second.
    pub fn new() -> Self {
        Self::with_polls_to_finish(2)
    }

    /// Creates a scheduler whose tasks terminate after the given number of
    /// query rounds.
    pub fn with_polls_to_finish(polls_to_finish: u32) -> Self {
        Self {
            polls_to_finish: polls_to_finish.max(1),
            inner: Mutex::new(Inner {
                next_id: 1000,
                ..Default::default()
            }),
        }
    }

    /// Scripts the outcomes of successive attempts for the given record.
    ///
    /// Unscripted attempts succeed.
    pub async fn plan(&self, record: &Value, outcomes: impl IntoIterator<Item = TaskOutcome>) {
        let mut inner = self.inner.lock().await;
        inner
            .outcomes
            .entry(record.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Scripts how many query rounds attempts for the given record take to
    /// terminate, overriding the scheduler-wide default.
    pub async fn plan_duration(&self, record: &Value, polls: u32) {
        let mut inner = self.inner.lock().await;
        inner.durations.insert(record.to_string(), polls.max(1));
    }

    /// Registers an array as if it had been submitted before this
    /// scheduler was created, without recording a submission.
    ///
    /// Used to simulate supervisor restarts.
    pub async fn seed_array(&self, id: u64, name: &str, records: &[Value]) {
        let mut inner = self.inner.lock().await;
        let tasks = inner.build_tasks(records, self.polls_to_finish);
        inner.arrays.insert(
            id,
            VirtualArray {
                name: name.to_string(),
                tasks,
                polls: 0,
                cancelled: false,
            },
        );
        inner.next_id = inner.next_id.max(id + 1);
    }

    /// Makes the next `n` queries fail with a timeout.
    pub async fn fail_next_queries(&self, n: u32) {
        self.inner.lock().await.failing_queries = n;
    }

    /// Gets every submission recorded so far.
    pub async fn submissions(&self) -> Vec<Submission> {
        self.inner.lock().await.submissions.clone()
    }

    /// Gets every cancellation recorded so far.
    pub async fn cancellations(&self) -> Vec<(ArrayJobId, Option<Vec<u32>>)> {
        self.inner.lock().await.cancellations.clone()
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for VirtualScheduler {
    async fn submit_array(&self, request: &ArrayRequest) -> Result<ArrayJobId> {
        let mut inner = self.inner.lock().await;

        let id = inner.next_id;
        inner.next_id += 1;

        let tasks = inner.build_tasks(&request.records, self.polls_to_finish);
        inner.arrays.insert(
            id,
            VirtualArray {
                name: request.name.clone(),
                tasks,
                polls: 0,
                cancelled: false,
            },
        );

        inner.submissions.push(Submission {
            id: ArrayJobId(id),
            name: request.name.clone(),
            resources: request.resources.clone(),
            records: request.records.clone(),
            at: Instant::now(),
        });

        Ok(ArrayJobId(id))
    }

    async fn query(&self, id: ArrayJobId) -> Result<HashMap<u32, TaskState>> {
        let mut inner = self.inner.lock().await;

        if inner.failing_queries > 0 {
            inner.failing_queries -= 1;
            return Err(SchedulerError::Timeout {
                program: "virtual".to_string(),
                seconds: 0,
            });
        }

        let Some(array) = inner.arrays.get_mut(&id.0) else {
            // A forgotten array yields no information, like `sacct`.
            return Ok(HashMap::new());
        };

        array.polls += 1;
        let states = array
            .tasks
            .iter()
            .enumerate()
            .map(|(task_id, task)| {
                let state = if array.cancelled {
                    TaskState::Failed(EXIT_CANCELLED)
                } else if array.polls >= task.finish_after {
                    task.outcome.to_task_state()
                } else {
                    TaskState::Running
                };
                (task_id as u32, state)
            })
            .collect();

        Ok(states)
    }

    async fn cancel(&self, id: ArrayJobId, task_ids: Option<&[u32]>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .cancellations
            .push((id, task_ids.map(|tasks| tasks.to_vec())));

        if let Some(array) = inner.arrays.get_mut(&id.0) {
            array.cancelled = true;
        }

        Ok(())
    }

    async fn list_active(&self, _account: &str, name_prefix: &str) -> Result<Vec<ArrayJobId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .arrays
            .iter()
            .filter(|(_, array)| {
                name_matches(&array.name, name_prefix)
                    && !array.cancelled
                    && array
                        .tasks
                        .iter()
                        .any(|task| array.polls < task.finish_after)
            })
            .map(|(id, _)| ArrayJobId(*id))
            .collect())
    }
}
