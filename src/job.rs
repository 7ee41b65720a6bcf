//! Job records and the processing payload they carry.
//!
//! A [`Job`] is the durable record the store persists and the scheduler
//! claims. Its lifecycle is captured by timestamps and lock fields rather than a
//! stored status column; [`JobStatus::derive`] turns those signals into the
//! closed status enum with a fixed precedence.

use crate::{
    FramecastError, Result,
    cron::CronSchedule,
    priority::JobPriority,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

/// Handler name of the video overlay job.
pub const PROCESS_VIDEO: &str = "process video";

/// Handler name of the nightly maintenance job.
pub const CLEANUP_OLD_FILES: &str = "cleanup old files";

/// Externally visible lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Computes the status from the lifecycle signals of a record.
    ///
    /// Precedence is `Failed > Completed > Processing > Pending`: a failure
    /// timestamp wins over everything, a finish timestamp wins over a lock.
    pub fn derive(
        failed_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        locked_at: Option<DateTime<Utc>>,
    ) -> Self {
        if failed_at.is_some() {
            JobStatus::Failed
        } else if finished_at.is_some() {
            JobStatus::Completed
        } else if locked_at.is_some() {
            JobStatus::Processing
        } else {
            JobStatus::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload submitted by the upload layer for one overlay job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobData {
    pub video_path: String,
    pub frame_path: String,
    /// Seconds into the video at which the overlay appears.
    pub start_time: f64,
    /// Seconds the overlay stays visible.
    pub duration: f64,
    pub output_path: String,
    pub user_id: String,
    pub job_id: String,
}

impl ProcessingJobData {
    /// Checks the shape of the payload: required strings are non-empty and the
    /// timing window is well formed.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("videoPath", &self.video_path),
            ("framePath", &self.frame_path),
            ("outputPath", &self.output_path),
            ("userId", &self.user_id),
            ("jobId", &self.job_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(FramecastError::invalid_input(format!("{} is required", field)));
            }
        }

        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(FramecastError::invalid_input("Start time must be non-negative"));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(FramecastError::invalid_input("Duration must be positive"));
        }

        Ok(())
    }
}

/// A durable job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Internal record identifier.
    pub id: JobId,
    /// Name of the handler this job is dispatched to.
    pub name: String,
    pub data: serde_json::Value,
    pub priority: JobPriority,
    /// Caller-supplied key enforcing one record per (`name`, key).
    pub job_key: Option<String>,
    /// Submitting user, used for per-user listings.
    pub owner: Option<String>,
    /// Completion percentage, 0 to 100.
    pub progress: u8,
    pub repeat_cron: Option<String>,
    pub repeat_timezone: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            priority: JobPriority::Normal,
            job_key: None,
            owner: None,
            progress: 0,
            repeat_cron: None,
            repeat_timezone: None,
            queued_at: now,
            next_run_at: now,
            locked_at: None,
            locked_by: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            fail_reason: None,
        }
    }

    /// Builds the record for a video overlay submission, keyed on its `jobId`
    /// and owned by its `userId`.
    pub fn processing(data: &ProcessingJobData) -> Result<Self> {
        Ok(Self::new(PROCESS_VIDEO, serde_json::to_value(data)?)
            .as_high_priority()
            .with_key(data.job_id.clone())
            .with_owner(data.user_id.clone()))
    }

    /// Builds a payload-less recurring record whose first run is the next
    /// fire time of `schedule` after `now`.
    pub fn recurring(
        name: impl Into<String>,
        schedule: &CronSchedule,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut job = Self::new(name, serde_json::json!({}));
        job.repeat_cron = Some(schedule.expression.clone());
        job.repeat_timezone = Some(schedule.timezone.clone());
        job.queued_at = now;
        job.next_run_at = schedule.require_next_execution(now)?;
        Ok(job)
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn as_high_priority(self) -> Self {
        self.with_priority(JobPriority::High)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.job_key = Some(key.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_next_run_at(mut self, next_run_at: DateTime<Utc>) -> Self {
        self.next_run_at = next_run_at;
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat_cron.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::derive(self.failed_at, self.last_finished_at, self.locked_at)
    }

    /// Whether the record may be claimed at `now`.
    ///
    /// One-off jobs run once; recurring jobs stay runnable and are gated only by
    /// their next fire time.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        if self.locked_at.is_some() || self.next_run_at > now {
            return false;
        }
        self.is_recurring() || (self.last_finished_at.is_none() && self.failed_at.is_none())
    }

    /// Whether the lock was taken before `cutoff` and is therefore stale.
    pub fn lock_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.locked_at.is_some_and(|locked_at| locked_at < cutoff)
    }

    /// Parses the record's cron schedule, if it is recurring.
    pub fn cron_schedule(&self) -> Result<Option<CronSchedule>> {
        match &self.repeat_cron {
            Some(expression) => {
                let timezone = self.repeat_timezone.as_deref().unwrap_or("UTC");
                Ok(Some(CronSchedule::with_timezone(expression, timezone)?))
            }
            None => Ok(None),
        }
    }

    /// Decodes the payload as a video overlay submission.
    pub fn processing_data(&self) -> Result<ProcessingJobData> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// The result path, only once the job has completed.
    pub fn output_path(&self) -> Option<String> {
        if self.status() != JobStatus::Completed {
            return None;
        }
        self.data
            .get("outputPath")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample_data() -> ProcessingJobData {
        ProcessingJobData {
            video_path: "/uploads/v.mp4".to_string(),
            frame_path: "/uploads/f.png".to_string(),
            start_time: 10.0,
            duration: 5.0,
            output_path: "/outputs/out.mp4".to_string(),
            user_id: "u1".to_string(),
            job_id: "j1".to_string(),
        }
    }

    #[test]
    fn test_status_precedence() {
        let t = Some(Utc::now());
        assert_eq!(JobStatus::derive(None, None, None), JobStatus::Pending);
        assert_eq!(JobStatus::derive(None, None, t), JobStatus::Processing);
        assert_eq!(JobStatus::derive(None, t, t), JobStatus::Completed);
        assert_eq!(JobStatus::derive(t, None, None), JobStatus::Failed);
        assert_eq!(JobStatus::derive(t, t, t), JobStatus::Failed);
        assert_eq!(JobStatus::derive(t, None, t), JobStatus::Failed);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Processing).unwrap(), "\"processing\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_payload_uses_camel_case() {
        let value = serde_json::to_value(sample_data()).unwrap();
        assert_eq!(value["videoPath"], "/uploads/v.mp4");
        assert_eq!(value["startTime"], 10.0);
        assert_eq!(value["jobId"], "j1");

        let parsed: ProcessingJobData = serde_json::from_value(json!({
            "videoPath": "v.mp4", "framePath": "f.png", "startTime": 0,
            "duration": 1.5, "outputPath": "out.mp4", "userId": "u", "jobId": "j"
        }))
        .unwrap();
        assert_eq!(parsed.duration, 1.5);
    }

    #[test]
    fn test_payload_validation() {
        assert!(sample_data().validate().is_ok());

        let mut data = sample_data();
        data.start_time = -1.0;
        assert!(matches!(data.validate(), Err(FramecastError::InvalidInput { .. })));

        let mut data = sample_data();
        data.duration = 0.0;
        assert!(data.validate().is_err());

        let mut data = sample_data();
        data.job_id = "  ".to_string();
        let err = data.validate().unwrap_err();
        assert!(err.to_string().contains("jobId"));
    }

    #[test]
    fn test_processing_job_record() {
        let job = Job::processing(&sample_data()).unwrap();
        assert_eq!(job.name, PROCESS_VIDEO);
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(job.job_key.as_deref(), Some("j1"));
        assert_eq!(job.owner.as_deref(), Some("u1"));
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.processing_data().unwrap(), sample_data());
        // The requested output path is not a result until completion
        assert_eq!(job.output_path(), None);
    }

    #[test]
    fn test_runnable_rules() {
        let now = Utc::now();
        let mut job = Job::new("work", json!({})).with_next_run_at(now - Duration::seconds(1));
        assert!(job.is_runnable(now));

        job.locked_at = Some(now);
        assert!(!job.is_runnable(now));

        job.locked_at = None;
        job.last_finished_at = Some(now);
        assert!(!job.is_runnable(now));

        let future = Job::new("work", json!({})).with_next_run_at(now + Duration::minutes(5));
        assert!(!future.is_runnable(now));
    }

    #[test]
    fn test_recurring_job_stays_runnable_after_finishing() {
        let now = Utc::now();
        let schedule = CronSchedule::new("0 2 * * *").unwrap();
        let mut job = Job::recurring(CLEANUP_OLD_FILES, &schedule, now).unwrap();
        assert!(job.is_recurring());
        assert!(job.next_run_at > now);
        assert!(!job.is_runnable(now));

        job.last_finished_at = Some(now);
        job.next_run_at = now - Duration::seconds(1);
        assert!(job.is_runnable(now));
        assert_eq!(job.cron_schedule().unwrap().unwrap().expression, "0 2 * * *");
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let mut job = Job::new("work", json!({}));
        assert!(!job.lock_expired(now));

        job.locked_at = Some(now - Duration::minutes(11));
        assert!(job.lock_expired(now - Duration::minutes(10)));
        assert!(!job.lock_expired(now - Duration::minutes(12)));
    }

    #[test]
    fn test_output_path_only_when_completed() {
        let mut job = Job::processing(&sample_data()).unwrap();
        job.last_finished_at = Some(Utc::now());
        assert_eq!(job.output_path().as_deref(), Some("/outputs/out.mp4"));

        job.failed_at = Some(Utc::now());
        assert_eq!(job.output_path(), None);
    }
}
