//! The file-backed work-package store and run directory layout.
//!
//! Each base job gets an append-only JSON-Lines file under its run
//! directory (`<log_dir>/<run_id>/state/<job>.jsonl`); every upsert appends
//! the package's full serialized form, and opening the store replays the
//! log with last-wins semantics per `(job_name, index)`. A torn trailing
//! line from a crash is tolerated: the affected package is at worst one
//! transition stale and is re-queried against the scheduler at startup.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::store::ExternalId;
use crate::store::Result;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::WorkPackage;
use crate::store::WorkState;

/// The name of the symlink pointing at a job's most recent run directory.
const LATEST: &str = "_latest";

/// The subdirectory holding store files.
const STATE_DIR: &str = "state";

/// The subdirectory holding generated bucket work files.
const WORK_DIR: &str = "work";

/// Wraps an I/O error with the path it occurred on.
fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The on-disk layout of a single pipeline run.
///
/// Every job keeps its run state under its own `log_dir`; a run ties them
/// together with a shared run id. A `_latest` symlink per log directory
/// points at the current run so the CLI can find it without bookkeeping.
#[derive(Debug, Clone)]
pub struct RunLayout {
    /// The shared run identifier.
    run_id: String,
    /// Run directories keyed by base job name.
    dirs: Vec<(String, PathBuf)>,
}

impl RunLayout {
    /// Creates a fresh run layout for the given pipeline.
    ///
    /// Creates the per-job run directories (with `state/` and `work/`
    /// subdirectories) and repoints each job's `_latest` symlink.
    pub fn create(config: &PipelineConfig) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let mut dirs = Vec::with_capacity(config.jobs.len());

        for job in &config.jobs {
            let dir = job.log_dir.join(&run_id);
            for sub in [STATE_DIR, WORK_DIR] {
                let path = dir.join(sub);
                std::fs::create_dir_all(&path).map_err(io_error(&path))?;
            }

            point_latest(&job.log_dir, &run_id);
            dirs.push((job.name.clone(), dir));
        }

        debug!("created run layout `{run_id}`");
        Ok(Self { run_id, dirs })
    }

    /// Opens the most recent run layout for the given pipeline by
    /// resolving each job's `_latest` symlink.
    pub fn open_latest(config: &PipelineConfig) -> Result<Self> {
        let mut run_id = None;
        let mut dirs = Vec::with_capacity(config.jobs.len());

        for job in &config.jobs {
            let link = job.log_dir.join(LATEST);
            let target = std::fs::read_link(&link)
                .map_err(|_| StoreError::NoPriorRun(job.log_dir.clone()))?;
            let dir = job.log_dir.join(&target);
            if !dir.is_dir() {
                return Err(StoreError::NoPriorRun(job.log_dir.clone()));
            }

            if run_id.is_none() {
                run_id = Some(target.to_string_lossy().into_owned());
            }

            dirs.push((job.name.clone(), dir));
        }

        Ok(Self {
            // SAFETY: validation guarantees at least one job.
            run_id: run_id.unwrap(),
            dirs,
        })
    }

    /// Gets the shared run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Gets the run directory for a base job.
    pub fn job_dir(&self, job: &str) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|(name, _)| name == job)
            .map(|(_, dir)| dir.as_path())
    }

    /// Iterates over `(job, run_dir)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.dirs
            .iter()
            .map(|(name, dir)| (name.as_str(), dir.as_path()))
    }
}

/// Repoints the `_latest` symlink in `log_dir` at `run_id`.
fn point_latest(log_dir: &Path, run_id: &str) {
    let link = log_dir.join(LATEST);
    let _ = std::fs::remove_file(&link);

    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(run_id, &link);

    #[cfg(windows)]
    let result = std::os::windows::fs::symlink_dir(run_id, &link);

    if let Err(e) = result {
        warn!(
            "failed to create `{LATEST}` symlink at `{link}`: {e}",
            link = link.display()
        );
    }
}

/// The mutable state behind a [`FileStore`].
#[derive(Debug, Default)]
struct Inner {
    /// All packages keyed by `(job_name, index)`.
    packages: BTreeMap<(String, u32), WorkPackage>,
    /// Open append handles keyed by base job name.
    files: HashMap<String, tokio::fs::File>,
}

/// The file-backed store implementation.
#[derive(Debug)]
pub struct FileStore {
    /// State file paths keyed by base job name.
    paths: HashMap<String, PathBuf>,
    /// The replayed packages and open append handles.
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Opens the store for a run layout, replaying any existing state
    /// files.
    pub fn open(layout: &RunLayout) -> Result<Self> {
        let mut paths = HashMap::new();
        let mut packages = BTreeMap::new();

        for (job, dir) in layout.iter() {
            let path = dir.join(STATE_DIR).join(format!("{job}.jsonl"));
            if path.is_file() {
                replay(&path, &mut packages)?;
            }

            paths.insert(job.to_string(), path);
        }

        Ok(Self {
            paths,
            inner: Mutex::new(Inner {
                packages,
                files: HashMap::new(),
            }),
        })
    }

    /// Gets the state file path for a package's base job.
    fn path_for(&self, wp: &WorkPackage) -> Result<&PathBuf> {
        self.paths.get(wp.base_job()).ok_or_else(|| StoreError::Io {
            path: PathBuf::from(wp.base_job()),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "job has no state file in this run",
            ),
        })
    }
}

/// Replays a state file into the package map with last-wins semantics.
fn replay(path: &Path, packages: &mut BTreeMap<(String, u32), WorkPackage>) -> Result<()> {
    let text = std::fs::read_to_string(path).map_err(io_error(path))?;

    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<WorkPackage>(line) {
            Ok(wp) => {
                packages.insert(wp.key(), wp);
            }
            Err(e) => {
                // Most likely a torn write from a crash mid-append; the
                // package's previous entry still stands and reconciliation
                // re-queries the scheduler for its true state.
                warn!(
                    "skipping unreadable store line {line} in `{path}`: {e}",
                    line = number + 1,
                    path = path.display()
                );
            }
        }
    }

    Ok(())
}

#[async_trait::async_trait]
impl Store for FileStore {
    async fn upsert(&self, wp: &WorkPackage) -> Result<()> {
        let path = self.path_for(wp)?.clone();
        let line = serde_json::to_string(wp)?;

        let mut inner = self.inner.lock().await;

        if !inner.files.contains_key(wp.base_job()) {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(io_error(&path))?;
            inner.files.insert(wp.base_job().to_string(), file);
        }

        // SAFETY: inserted above if absent.
        let file = inner.files.get_mut(wp.base_job()).unwrap();
        file.write_all(line.as_bytes())
            .await
            .map_err(io_error(&path))?;
        file.write_all(b"\n").await.map_err(io_error(&path))?;
        file.flush().await.map_err(io_error(&path))?;

        // Submission and terminalization transitions must survive a crash;
        // intermediate transitions may be replayed from the scheduler.
        if wp.state == WorkState::Submitted || wp.state.is_terminal() {
            file.sync_data().await.map_err(io_error(&path))?;
        }

        inner.packages.insert(wp.key(), wp.clone());
        Ok(())
    }

    async fn job(&self, job: &str) -> Result<Vec<WorkPackage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .packages
            .values()
            .filter(|wp| wp.base_job() == job)
            .cloned()
            .collect())
    }

    async fn by_external(&self, id: ExternalId) -> Result<Option<WorkPackage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .packages
            .values()
            .find(|wp| wp.external == Some(id))
            .cloned())
    }

    async fn snapshot(&self) -> Result<Vec<WorkPackage>> {
        let inner = self.inner.lock().await;
        Ok(inner.packages.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::Resources;
    use crate::config::TimeLimit;

    /// Builds a layout with a single job rooted in a temp directory.
    fn layout(dir: &TempDir) -> RunLayout {
        let job_dir = dir.path().join("logs").join("run-1");
        std::fs::create_dir_all(job_dir.join(STATE_DIR)).unwrap();
        RunLayout {
            run_id: "run-1".to_string(),
            dirs: vec![("etl".to_string(), job_dir)],
        }
    }

    /// Builds a pending package for the `etl` job.
    fn package(job_name: &str, index: u32) -> WorkPackage {
        WorkPackage::new(
            job_name.to_string(),
            index,
            json!({"x": index}),
            Resources {
                cpus: 1,
                time: TimeLimit::try_from("00:10:00".to_string()).unwrap(),
                memory: None,
            },
        )
    }

    #[tokio::test]
    async fn replay_is_last_wins() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);

        {
            let store = FileStore::open(&layout).unwrap();
            let mut wp = package("etl", 0);
            store.upsert(&wp).await.unwrap();
            wp.mark_submitted(
                ExternalId {
                    array_job_id: 99,
                    task_id: 0,
                },
                "99_0.stdout".into(),
                "99_0.stderr".into(),
            );
            store.upsert(&wp).await.unwrap();
            store.upsert(&package("etl", 1)).await.unwrap();
        }

        let store = FileStore::open(&layout).unwrap();
        let packages = store.job("etl").await.unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].state, WorkState::Submitted);
        assert_eq!(packages[0].attempt, 1);
        assert_eq!(packages[1].state, WorkState::Pending);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);

        {
            let store = FileStore::open(&layout).unwrap();
            store.upsert(&package("etl", 0)).await.unwrap();
        }

        // Simulate a crash mid-append.
        let path = layout.job_dir("etl").unwrap().join(STATE_DIR).join("etl.jsonl");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"job_name\": \"etl\", \"ind");
        std::fs::write(&path, text).unwrap();

        let store = FileStore::open(&layout).unwrap();
        let packages = store.job("etl").await.unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].state, WorkState::Pending);
    }

    #[tokio::test]
    async fn job_includes_special_case_buckets() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);

        let store = FileStore::open(&layout).unwrap();
        store.upsert(&package("etl", 0)).await.unwrap();
        store.upsert(&package("etl.small", 0)).await.unwrap();

        let packages = store.job("etl").await.unwrap();
        assert_eq!(packages.len(), 2);

        let names: Vec<_> = packages.iter().map(|wp| wp.job_name.as_str()).collect();
        assert_eq!(names, vec!["etl", "etl.small"]);
    }

    #[tokio::test]
    async fn by_external_finds_current_assignment_only() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);

        let store = FileStore::open(&layout).unwrap();
        let mut wp = package("etl", 0);
        let first = ExternalId {
            array_job_id: 7,
            task_id: 0,
        };
        wp.mark_submitted(first, "7_0.stdout".into(), "7_0.stderr".into());
        store.upsert(&wp).await.unwrap();

        wp.mark_retryable(crate::store::WorkError {
            exit_code: Some(1),
            message: "task failed".to_string(),
            stderr_tail: None,
        });
        let second = ExternalId {
            array_job_id: 8,
            task_id: 0,
        };
        wp.mark_submitted(second, "8_0.stdout".into(), "8_0.stderr".into());
        store.upsert(&wp).await.unwrap();

        assert!(store.by_external(first).await.unwrap().is_none());
        let found = store.by_external(second).await.unwrap().unwrap();
        assert_eq!(found.prior_external, vec![first]);
    }
}
