//! The durable work-package store.
//!
//! The store is the authoritative record of every work package across
//! supervisor restarts: a crash-tolerant mapping from `(job_name, index)`
//! to state and metadata. Only the supervisor writes to it; the CLI reads
//! snapshots.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub mod file;
pub mod models;

pub use file::FileStore;
pub use file::RunLayout;
pub use models::ExternalId;
pub use models::StateCounts;
pub use models::WorkError;
pub use models::WorkPackage;
pub use models::WorkState;

/// Store errors.
///
/// A store write error is fatal: the supervisor aborts rather than risk a
/// split brain between its memory and the durable record.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error against a store file.
    #[error("store i/o error on `{path}`")]
    Io {
        /// The affected path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A serialization error.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    /// No run state exists where one was expected.
    #[error("no prior run found under `{0}`")]
    NoPriorRun(PathBuf),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A durable, crash-tolerant work-package store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Writes a package through to durable storage.
    ///
    /// Transitions crossing a submission or terminalization boundary are
    /// fsynced before the call returns.
    async fn upsert(&self, wp: &WorkPackage) -> Result<()>;

    /// Gets all packages for a base job, including its special-case
    /// buckets, ordered by `(job_name, index)`.
    async fn job(&self, job: &str) -> Result<Vec<WorkPackage>>;

    /// Reverse lookup by current scheduler identity, for poll
    /// reconciliation.
    async fn by_external(&self, id: ExternalId) -> Result<Option<WorkPackage>>;

    /// Gets a consistent snapshot of the entire store.
    async fn snapshot(&self) -> Result<Vec<WorkPackage>>;
}
