use anyhow::Result;
use clap::Subcommand;
use framecast::{
    FramecastError, JobStatus, JobStore, ProcessingJobData, ProcessingQueue,
    queue::DEFAULT_USER_JOB_LIMIT,
};
use std::sync::{Arc, atomic::AtomicBool};

use super::{CommandContext, connect_store};
use crate::display::{JobTable, job_details, status_label};

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    #[command(about = "Queue a video overlay job")]
    Enqueue {
        #[arg(long, help = "Base video file")]
        video: String,
        #[arg(long, help = "Overlay image or clip")]
        frame: String,
        #[arg(long, help = "Overlay start, in seconds")]
        start: f64,
        #[arg(long, help = "Overlay duration, in seconds")]
        duration: f64,
        #[arg(long, help = "Where to write the rendered video")]
        output: String,
        #[arg(long, help = "Owning user")]
        user: String,
        #[arg(long, help = "Caller job id (defaults to a random UUID)")]
        job_id: Option<String>,
    },

    #[command(about = "Show the status of a job")]
    Status {
        job_id: String,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    #[command(about = "Show the output path of a completed job")]
    Result { job_id: String },

    #[command(about = "List a user's most recent jobs")]
    Jobs {
        user_id: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_USER_JOB_LIMIT, help = "Maximum jobs to list")]
        limit: usize,
        #[arg(long, help = "Print the reports as JSON")]
        json: bool,
    },

    #[command(about = "Cancel a job that has not started")]
    Cancel { job_id: String },
}

impl JobCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let queue = open_queue(ctx).await?;

        match self {
            JobCommand::Enqueue {
                video,
                frame,
                start,
                duration,
                output,
                user,
                job_id,
            } => {
                let data = ProcessingJobData {
                    video_path: video.clone(),
                    frame_path: frame.clone(),
                    start_time: *start,
                    duration: *duration,
                    output_path: output.clone(),
                    user_id: user.clone(),
                    job_id: job_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                };
                let submission = queue.add_video_processing_job(data).await?;
                if submission.duplicate {
                    println!("⚠️  Job {} was already queued", submission.job_id);
                } else {
                    println!("✅ Queued job {}", submission.job_id);
                }
            }
            JobCommand::Status { job_id, json } => {
                let report = queue.get_job_status(job_id).await?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!("{}", job_details(&report));
                }
            }
            JobCommand::Result { job_id } => {
                let result = queue.get_job_result(job_id).await?;
                match result.status {
                    JobStatus::Completed => println!("{}", result.output_path),
                    status => {
                        anyhow::bail!("Job {} has no output yet ({})", job_id, status_label(status))
                    }
                }
            }
            JobCommand::Jobs {
                user_id,
                limit,
                json,
            } => {
                let reports = queue.get_user_jobs(user_id, *limit).await?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&reports)?);
                } else if reports.is_empty() {
                    println!("No jobs for {}", user_id);
                } else {
                    let mut table = JobTable::new();
                    for report in &reports {
                        table.add_report(report);
                    }
                    println!("{}", table);
                }
            }
            JobCommand::Cancel { job_id } => match queue.cancel_job(job_id).await? {
                0 => match queue.get_job_status(job_id).await {
                    Ok(report) => anyhow::bail!(
                        "Job {} cannot be cancelled while {}",
                        job_id,
                        report.status
                    ),
                    Err(FramecastError::JobNotFound { .. }) => {
                        anyhow::bail!("Job {} not found", job_id)
                    }
                    Err(e) => return Err(e.into()),
                },
                _ => println!("🗑️  Cancelled job {}", job_id),
            },
        }
        Ok(())
    }
}

/// The CLI reads and writes the store directly, so its queue is open as soon
/// as the store answers.
async fn open_queue(ctx: &CommandContext) -> Result<ProcessingQueue> {
    let store = connect_store(&ctx.config).await?;
    if !store.health_check().await {
        anyhow::bail!("Job store at {} is not answering", ctx.config.database.url);
    }
    Ok(ProcessingQueue::new(
        Arc::new(store),
        Arc::new(AtomicBool::new(true)),
    ))
}
