//! Durable job storage.
//!
//! The [`JobStore`] trait is the only coordination point between scheduler
//! processes: every claim, lock, progress write and outcome goes through it.
//! Two backends implement it:
//!
//! - [`postgres::PostgresStore`] (feature `postgres`, on by default) for production
//! - [`memory::MemoryStore`] for tests and single-process development
//!
//! # Examples
//!
//! ```rust
//! use framecast::store::{EnqueueOutcome, JobStore, memory::MemoryStore};
//! use framecast::Job;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> framecast::Result<()> {
//! let store = MemoryStore::new();
//! let job = Job::new("resize", json!({"width": 640})).with_key("abc");
//!
//! let first = store.enqueue(job.clone()).await?;
//! let second = store.enqueue(job).await?;
//! assert!(matches!(first, EnqueueOutcome::Created(_)));
//! assert_eq!(second, EnqueueOutcome::Existing(first.id()));
//! # Ok(())
//! # }
//! ```

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::{
    Result,
    job::{Job, JobId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of inserting a job that may already exist under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    /// A new record was written.
    Created(JobId),
    /// A record with the same name and key was already stored; nothing changed.
    Existing(JobId),
}

impl EnqueueOutcome {
    pub fn id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Existing(_))
    }
}

/// Selects records for lookup, listing and cancellation.
///
/// Empty criteria match everything; set fields are combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub name: Option<String>,
    pub job_key: Option<String>,
    pub owner: Option<String>,
    pub limit: Option<usize>,
    /// Order by submission time, newest first. Otherwise oldest first.
    pub newest_first: bool,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            job_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Whether `job` satisfies the criteria, ignoring limit and ordering.
    pub fn matches(&self, job: &Job) -> bool {
        self.id.is_none_or(|id| job.id == id)
            && self.name.as_ref().is_none_or(|name| &job.name == name)
            && self
                .job_key
                .as_ref()
                .is_none_or(|key| job.job_key.as_ref() == Some(key))
            && self
                .owner
                .as_ref()
                .is_none_or(|owner| job.owner.as_ref() == Some(owner))
    }
}

/// How many jobs of one handler may hold a lock at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCap {
    pub name: String,
    pub max_running: u32,
}

impl HandlerCap {
    pub fn new(name: impl Into<String>, max_running: u32) -> Self {
        Self {
            name: name.into(),
            max_running,
        }
    }
}

/// Parameters of a single claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identity written to `locked_by`.
    pub worker: String,
    pub now: DateTime<Utc>,
    /// Handlers this worker can run. Jobs with other names are never claimed.
    pub handlers: Vec<HandlerCap>,
}

/// Outcome written back for a recurring run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates the backing tables and indexes if they do not exist.
    async fn create_tables(&self) -> Result<()>;

    /// Cheap round trip to the backend.
    async fn health_check(&self) -> bool;

    /// Inserts `job` unless a record with the same name and key exists.
    ///
    /// Jobs without a key are always inserted.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome>;

    /// Ensures exactly one recurring record exists for `job.name`.
    ///
    /// An existing record keeps its pending fire time unless the cron
    /// expression or timezone changed.
    async fn upsert_recurring(&self, job: Job) -> Result<JobId>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Atomically locks the best eligible job for the requesting worker.
    ///
    /// Eligible jobs are ordered by priority (highest first) then fire time
    /// (earliest first). A handler at its running cap is skipped. Two
    /// concurrent callers never receive the same job.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>>;

    /// Raises the progress of a job locked by `worker`. Progress never
    /// decreases. When `heartbeat` is set the lock timestamp moves to it.
    ///
    /// Fails with `LeaseLost` when `worker` no longer holds the lock.
    async fn update_progress(
        &self,
        id: JobId,
        worker: &str,
        progress: u8,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Marks a one-off job completed and merges `output` into its data.
    async fn complete_job(
        &self,
        id: JobId,
        worker: &str,
        output: Option<serde_json::Value>,
        finished_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Marks a one-off job failed with `reason`.
    async fn fail_job(
        &self,
        id: JobId,
        worker: &str,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Records the outcome of a recurring run and re-arms it for `next_run_at`.
    async fn reschedule_recurring(
        &self,
        id: JobId,
        worker: &str,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Clears locks taken before `cutoff` so other workers can reclaim them.
    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Deletes matching records that are not currently locked.
    async fn cancel(&self, filter: &JobFilter) -> Result<u64>;

    /// Deletes finished or failed one-off records older than `cutoff` and
    /// returns them.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matching() {
        let job = Job::new("process video", json!({}))
            .with_key("j1")
            .with_owner("u1");

        assert!(JobFilter::new().matches(&job));
        assert!(JobFilter::by_key("process video", "j1").matches(&job));
        assert!(!JobFilter::by_key("process video", "j2").matches(&job));
        assert!(JobFilter::new().with_owner("u1").matches(&job));
        assert!(!JobFilter::new().with_owner("u2").matches(&job));
        assert!(!JobFilter::new().with_name("other").matches(&job));
    }

    #[test]
    fn test_keyless_job_does_not_match_key_filter() {
        let job = Job::new("process video", json!({}));
        assert!(!JobFilter::by_key("process video", "j1").matches(&job));
    }

    #[test]
    fn test_enqueue_outcome() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(EnqueueOutcome::Created(id).id(), id);
        assert!(EnqueueOutcome::Existing(id).is_duplicate());
        assert!(!EnqueueOutcome::Created(id).is_duplicate());
    }
}
