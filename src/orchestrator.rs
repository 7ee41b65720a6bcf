//! The "process video" pipeline.
//!
//! [`ProcessingOrchestrator::run`] validates the inputs of one overlay job,
//! reads the base video's metadata, checks the overlay window against it and
//! renders the result, reporting progress at fixed milestones:
//!
//! | stage                    | progress |
//! |--------------------------|----------|
//! | started                  | 5        |
//! | validating inputs        | 10       |
//! | inputs validated         | 20       |
//! | rendering                | 30 to 99 |
//! | done                     | 100      |

use crate::{
    FramecastError, Result,
    job::{PROCESS_VIDEO, ProcessingJobData},
    media::{
        MediaProbe, MediaRole, MediaTranscoder, OverlayRequest, ProgressFn, VideoMetadata,
        format::check_format,
    },
    scheduler::{JobContext, JobDefinition, JobHandler},
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod milestones {
    pub const STARTED: u8 = 5;
    pub const VALIDATING: u8 = 10;
    pub const VALIDATED: u8 = 20;
    pub const RENDERING: u8 = 30;
    /// Highest value reported while the render is still running.
    pub const RENDER_CEILING: u8 = 99;
    pub const COMPLETE: u8 = 100;
}

/// Destination for progress percentages.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, percent: u8) -> Result<()>;
}

/// Maps a render fraction into the rendering band of the milestone scale.
pub fn render_percent(fraction: f64) -> u8 {
    let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
    let span = f64::from(milestones::RENDER_CEILING - milestones::RENDERING);
    milestones::RENDERING + (fraction * span).floor() as u8
}

/// Checks that the overlay window `[start_time, start_time + duration]` lies
/// within the video.
pub fn check_timing(start_time: f64, duration: f64, metadata: &VideoMetadata) -> Result<()> {
    if start_time >= metadata.duration {
        return Err(FramecastError::timing_out_of_range(format!(
            "Start time ({}s) exceeds video duration ({}s)",
            start_time, metadata.duration
        )));
    }
    if start_time + duration > metadata.duration {
        return Err(FramecastError::timing_out_of_range(
            "Overlay duration exceeds remaining video time",
        ));
    }
    Ok(())
}

/// Labels a decode failure with the file it concerns. Tool failures, such as
/// a missing ffprobe or a timeout, are passed through unchanged.
fn unreadable(label: &str, err: FramecastError) -> FramecastError {
    match err {
        FramecastError::UnsupportedFormat { message } => FramecastError::unsupported_format(
            format!("{} file could not be read: {}", label, message),
        ),
        other => other,
    }
}

async fn ensure_readable(path: &Path, label: &str) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await.map_err(|_| {
        FramecastError::invalid_input(format!("{} file not found: {}", label, path.display()))
    })?;
    if !metadata.is_file() {
        return Err(FramecastError::invalid_input(format!(
            "{} path is not a file: {}",
            label,
            path.display()
        )));
    }
    tokio::fs::File::open(path).await.map_err(|e| {
        FramecastError::invalid_input(format!(
            "{} file is not readable: {}: {}",
            label,
            path.display(),
            e
        ))
    })?;
    Ok(())
}

pub struct ProcessingOrchestrator {
    probe: Arc<dyn MediaProbe>,
    transcoder: Arc<dyn MediaTranscoder>,
}

impl ProcessingOrchestrator {
    pub fn new(probe: Arc<dyn MediaProbe>, transcoder: Arc<dyn MediaTranscoder>) -> Self {
        Self { probe, transcoder }
    }

    /// Runs one overlay job to completion and returns the output path.
    pub async fn run(&self, data: &ProcessingJobData, progress: &dyn ProgressSink) -> Result<PathBuf> {
        data.validate()?;
        progress.report(milestones::STARTED).await?;
        info!(
            job_id = %data.job_id,
            user_id = %data.user_id,
            start_time = data.start_time,
            duration = data.duration,
            "Processing video overlay"
        );

        progress.report(milestones::VALIDATING).await?;
        let video_path = Path::new(&data.video_path);
        let frame_path = Path::new(&data.frame_path);

        ensure_readable(video_path, "Video").await?;
        ensure_readable(frame_path, "Frame").await?;

        let video_report = self
            .probe
            .probe(video_path)
            .await
            .map_err(|e| unreadable("Video", e))?;
        check_format(&video_report, video_path, MediaRole::Video)?;

        let frame_report = self
            .probe
            .probe(frame_path)
            .await
            .map_err(|e| unreadable("Frame", e))?;
        check_format(&frame_report, frame_path, MediaRole::Overlay)?;

        progress.report(milestones::VALIDATED).await?;

        let metadata = video_report.video_metadata()?;
        debug!(
            job_id = %data.job_id,
            duration = metadata.duration,
            width = metadata.width,
            height = metadata.height,
            format = %metadata.format,
            "Video metadata"
        );
        check_timing(data.start_time, data.duration, &metadata)?;

        progress.report(milestones::RENDERING).await?;
        let request = OverlayRequest::new(
            video_path,
            frame_path,
            data.start_time,
            data.duration,
            &data.output_path,
        )
        .with_frame_size(metadata.width, metadata.height)
        .with_expected_duration(metadata.duration);

        let output = self.render(&request, progress).await?;

        progress.report(milestones::COMPLETE).await?;
        info!(job_id = %data.job_id, output = %output.display(), "Video overlay completed");
        Ok(output)
    }

    /// Runs the transcoder while forwarding its progress to `progress`.
    ///
    /// The transcoder reports from a synchronous callback, so values go through
    /// a watch channel that is drained here between polls of the render.
    async fn render(&self, request: &OverlayRequest, progress: &dyn ProgressSink) -> Result<PathBuf> {
        let (tx, mut rx) = watch::channel(milestones::RENDERING);
        let on_progress: ProgressFn = Box::new(move |fraction| {
            let percent = render_percent(fraction);
            tx.send_if_modified(|current| {
                if percent > *current {
                    *current = percent;
                    true
                } else {
                    false
                }
            });
        });

        let render = self.transcoder.overlay(request, on_progress);
        tokio::pin!(render);

        let mut forwarding = true;
        loop {
            tokio::select! {
                result = &mut render => return result,
                changed = rx.changed(), if forwarding => {
                    if changed.is_err() {
                        forwarding = false;
                        continue;
                    }
                    let percent = *rx.borrow_and_update();
                    if let Err(e) = progress.report(percent).await {
                        warn!(percent, error = %e, "Failed to record render progress");
                    }
                }
            }
        }
    }

    /// The scheduler definition that runs this pipeline for `process video` jobs.
    pub fn job_definition(self: Arc<Self>, concurrency: u32) -> JobDefinition {
        let handler: JobHandler = Arc::new(move |ctx: JobContext| {
            let orchestrator = Arc::clone(&self);
            Box::pin(async move {
                let data: ProcessingJobData = ctx.data()?;
                let output = orchestrator.run(&data, &ctx).await?;
                Ok(Some(serde_json::json!({
                    "outputPath": output.to_string_lossy(),
                })))
            })
        });
        JobDefinition::new(PROCESS_VIDEO, handler).with_concurrency(concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(duration: f64) -> VideoMetadata {
        VideoMetadata {
            duration,
            width: 1280,
            height: 720,
            format: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            bitrate: 0,
        }
    }

    #[test]
    fn test_timing_within_video() {
        assert!(check_timing(10.0, 5.0, &metadata(20.0)).is_ok());
        // Ending exactly at the last frame is allowed
        assert!(check_timing(15.0, 5.0, &metadata(20.0)).is_ok());
        assert!(check_timing(0.0, 20.0, &metadata(20.0)).is_ok());
    }

    #[test]
    fn test_start_past_end() {
        let err = check_timing(12.0, 1.0, &metadata(10.0)).unwrap_err();
        assert!(matches!(err, FramecastError::TimingOutOfRange { .. }));
        assert!(err
            .to_string()
            .contains("Start time (12s) exceeds video duration (10s)"));

        // Starting exactly at the end leaves nothing to overlay
        assert!(check_timing(10.0, 1.0, &metadata(10.0)).is_err());
    }

    #[test]
    fn test_window_past_end() {
        let err = check_timing(8.0, 5.0, &metadata(10.0)).unwrap_err();
        assert!(err
            .to_string()
            .contains("Overlay duration exceeds remaining video time"));
    }

    #[test]
    fn test_render_percent_band() {
        assert_eq!(render_percent(0.0), milestones::RENDERING);
        assert_eq!(render_percent(0.5), 64);
        assert_eq!(render_percent(1.0), milestones::RENDER_CEILING);
        assert_eq!(render_percent(7.0), milestones::RENDER_CEILING);
        assert_eq!(render_percent(f64::NAN), milestones::RENDERING);
    }
}
