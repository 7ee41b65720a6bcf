//! The processing queue as seen by the upload layer.
//!
//! [`ProcessingQueue`] is addressed by the caller's `jobId`, never by internal
//! record ids. Every operation fails with
//! [`FramecastError::NotInitialized`] until the owning service has started.

use crate::{
    FramecastError, Result,
    job::{Job, JobId, JobStatus, PROCESS_VIDEO, ProcessingJobData},
    store::{EnqueueOutcome, JobFilter, JobStore},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info};

/// Default cap for [`ProcessingQueue::get_user_jobs`].
pub const DEFAULT_USER_JOB_LIMIT: usize = 10;

/// Acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// The caller's `jobId`.
    pub job_id: String,
    /// Internal record id.
    pub record_id: JobId,
    /// True when a job with this `jobId` was already queued and nothing was added.
    pub duplicate: bool,
}

/// The subset of the payload echoed back in status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSummary {
    pub video_path: String,
    pub frame_path: String,
    pub start_time: f64,
    pub duration: f64,
}

impl From<&ProcessingJobData> for ProcessingSummary {
    fn from(data: &ProcessingJobData) -> Self {
        Self {
            video_path: data.video_path.clone(),
            frame_path: data.frame_path.clone(),
            start_time: data.start_time,
            duration: data.duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    /// The caller's `jobId`.
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Present on single-job lookups, omitted from listings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_data: Option<ProcessingSummary>,
}

impl JobStatusReport {
    fn from_job(job: &Job, with_payload: bool) -> Result<Self> {
        let data = job.processing_data()?;
        Ok(Self {
            id: data.job_id.clone(),
            status: job.status(),
            progress: job.progress,
            error: job.fail_reason.clone(),
            created_at: job.queued_at,
            completed_at: job.last_finished_at,
            failed_at: job.failed_at,
            output_path: job.output_path(),
            processing_data: with_payload.then(|| ProcessingSummary::from(&data)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Empty unless the job completed.
    pub output_path: String,
    pub status: JobStatus,
}

#[derive(Clone)]
pub struct ProcessingQueue {
    store: Arc<dyn JobStore>,
    ready: Arc<AtomicBool>,
}

impl ProcessingQueue {
    /// Creates a queue gated on `ready`, which the owning service raises once
    /// the scheduler is running.
    pub fn new(store: Arc<dyn JobStore>, ready: Arc<AtomicBool>) -> Self {
        Self { store, ready }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(FramecastError::not_initialized("Processing queue has not been started"))
        }
    }

    async fn find_by_job_id(&self, job_id: &str) -> Result<Job> {
        self.store
            .find_jobs(&JobFilter::by_key(PROCESS_VIDEO, job_id).with_limit(1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FramecastError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    /// Queues a video overlay job. Submitting a `jobId` that is already stored
    /// returns the existing record flagged as a duplicate.
    pub async fn add_video_processing_job(&self, data: ProcessingJobData) -> Result<Submission> {
        self.ensure_ready()?;
        data.validate()?;

        let outcome = self.store.enqueue(Job::processing(&data)?).await?;
        match outcome {
            EnqueueOutcome::Created(id) => {
                info!(job_id = %data.job_id, record_id = %id, user_id = %data.user_id, "Video processing job queued");
            }
            EnqueueOutcome::Existing(id) => {
                debug!(job_id = %data.job_id, record_id = %id, "Duplicate submission ignored");
            }
        }

        Ok(Submission {
            job_id: data.job_id,
            record_id: outcome.id(),
            duplicate: outcome.is_duplicate(),
        })
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport> {
        self.ensure_ready()?;
        let job = self.find_by_job_id(job_id).await?;
        JobStatusReport::from_job(&job, true)
    }

    pub async fn get_job_result(&self, job_id: &str) -> Result<JobResult> {
        self.ensure_ready()?;
        let job = self.find_by_job_id(job_id).await?;
        Ok(JobResult {
            output_path: job.output_path().unwrap_or_default(),
            status: job.status(),
        })
    }

    /// Removes the job unless it is running. Returns how many records were
    /// removed, so 0 means it was running or never existed.
    pub async fn cancel_job(&self, job_id: &str) -> Result<u64> {
        self.ensure_ready()?;
        let removed = self
            .store
            .cancel(&JobFilter::by_key(PROCESS_VIDEO, job_id))
            .await?;
        info!(job_id = %job_id, removed, "Cancel requested");
        Ok(removed)
    }

    /// The user's most recent jobs, newest first.
    pub async fn get_user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<JobStatusReport>> {
        self.ensure_ready()?;
        let filter = JobFilter::new()
            .with_name(PROCESS_VIDEO)
            .with_owner(user_id)
            .newest_first()
            .with_limit(limit);

        self.store
            .find_jobs(&filter)
            .await?
            .iter()
            .map(|job| JobStatusReport::from_job(job, false))
            .collect()
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.store.health_check().await)
    }
}
