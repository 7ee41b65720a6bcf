//! # Framecast
//!
//! A database-driven job queue that burns an overlay frame into an uploaded
//! video with ffmpeg.
//!
//! ## Features
//!
//! - **Durable jobs**: records live in PostgreSQL (or in memory for tests) and
//!   survive restarts; abandoned locks are reclaimed after a lease expires
//! - **Atomic claiming**: several schedulers can share one store without ever
//!   running the same job twice
//! - **Priorities and caps**: higher-priority jobs are claimed first; each
//!   handler has its own running cap on top of a per-process ceiling
//! - **Progress**: milestones plus live ffmpeg progress written to the record
//! - **Cron maintenance**: a nightly task purges old jobs and their outputs
//! - **Idempotent submission**: one record per caller-supplied `jobId`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use framecast::{Framecast, FramecastConfig, ProcessingJobData};
//!
//! #[tokio::main]
//! async fn main() -> framecast::Result<()> {
//!     let config = FramecastConfig::from_env()?;
//!     framecast::logging::init(&config.logging)?;
//!
//!     let app = Framecast::connect(config).await?;
//!     app.start().await?;
//!
//!     let submission = app
//!         .queue()
//!         .add_video_processing_job(ProcessingJobData {
//!             video_path: "/uploads/clip.mp4".to_string(),
//!             frame_path: "/uploads/frame.png".to_string(),
//!             start_time: 10.0,
//!             duration: 5.0,
//!             output_path: "/outputs/clip-framed.mp4".to_string(),
//!             user_id: "user-1".to_string(),
//!             job_id: "job-1".to_string(),
//!         })
//!         .await?;
//!
//!     let status = app.queue().get_job_status(&submission.job_id).await?;
//!     println!("{} is {} ({}%)", status.id, status.status, status.progress);
//!
//!     app.shutdown().await
//! }
//! ```

pub mod app;
pub mod cleanup;
pub mod config;
pub mod cron;
pub mod error;
pub mod job;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod priority;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use app::Framecast;
pub use config::FramecastConfig;
pub use cron::{CronError, CronSchedule};
pub use error::FramecastError;
pub use job::{Job, JobId, JobStatus, ProcessingJobData};
pub use priority::{JobPriority, PriorityError};
pub use queue::{JobResult, JobStatusReport, ProcessingQueue, Submission};
pub use scheduler::{JobContext, JobDefinition, JobHandler, JobScheduler};
pub use store::{EnqueueOutcome, JobFilter, JobStore};

/// Convenient type alias for Results with [`FramecastError`] as the error type.
pub type Result<T> = std::result::Result<T, FramecastError>;
