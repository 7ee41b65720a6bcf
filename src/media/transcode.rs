//! FFmpeg overlay rendering with progress tracking.

use crate::{FramecastError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Receives the completed fraction of a render, from 0.0 to 1.0.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Lines of ffmpeg stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// A single overlay render: `frame_path` drawn over `video_path` between
/// `start_time` and `start_time + duration`, written to `output_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRequest {
    pub video_path: PathBuf,
    pub frame_path: PathBuf,
    pub output_path: PathBuf,
    pub start_time: f64,
    pub duration: f64,
    /// Size the frame is scaled to, normally the video's dimensions.
    pub frame_size: Option<(u32, u32)>,
    /// Length of the base video, used to turn ffmpeg's position into a fraction.
    pub expected_duration: Option<f64>,
}

impl OverlayRequest {
    pub fn new(
        video_path: impl Into<PathBuf>,
        frame_path: impl Into<PathBuf>,
        start_time: f64,
        duration: f64,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            frame_path: frame_path.into(),
            output_path: output_path.into(),
            start_time,
            duration,
            frame_size: None,
            expected_duration: None,
        }
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = Some((width, height));
        self
    }

    pub fn with_expected_duration(mut self, seconds: f64) -> Self {
        self.expected_duration = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(FramecastError::invalid_input("Start time must be non-negative"));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(FramecastError::invalid_input("Duration must be positive"));
        }
        Ok(())
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Builds the `-filter_complex` graph for an overlay.
///
/// The frame is stream `1:v`, the video is `0:v` and the result is `[v]`.
pub fn overlay_filter(start_time: f64, end_time: f64, frame_size: Option<(u32, u32)>) -> String {
    let enable = format!("enable='between(t,{},{})'", start_time, end_time);
    match frame_size {
        Some((width, height)) => format!(
            "[1:v]scale={}:{}[frame];[0:v][frame]overlay=0:0:{}[v]",
            width, height, enable
        ),
        None => format!("[0:v][1:v]overlay=0:0:{}[v]", enable),
    }
}

/// Builder for the ffmpeg invocation of an overlay render.
#[derive(Debug, Clone)]
pub struct OverlayCommand {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    output_args: Vec<String>,
}

impl OverlayCommand {
    /// Starts a command for `request` with its inputs, filter graph and stream
    /// mapping. Audio of the base video is copied when present.
    pub fn for_request(request: &OverlayRequest) -> Self {
        Self {
            inputs: vec![request.video_path.clone(), request.frame_path.clone()],
            output: request.output_path.clone(),
            output_args: Vec::new(),
        }
        .output_arg("-filter_complex")
        .output_arg(overlay_filter(
            request.start_time,
            request.end_time(),
            request.frame_size,
        ))
        .output_args(["-map", "[v]", "-map", "0:a?", "-c:a", "copy"])
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            // Machine-readable progress on stdout, diagnostics stay on stderr
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
        ];

        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().to_string());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Running state of ffmpeg's `-progress` key/value stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeProgress {
    /// Output position in microseconds.
    pub out_time_us: i64,
    pub is_complete: bool,
}

impl TranscodeProgress {
    /// Fraction of `total_secs` rendered so far, clamped to 0.0..=1.0.
    pub fn fraction_of(&self, total_secs: f64) -> f64 {
        if self.is_complete {
            return 1.0;
        }
        if total_secs <= 0.0 {
            return 0.0;
        }
        (self.out_time_us as f64 / 1_000_000.0 / total_secs).clamp(0.0, 1.0)
    }
}

/// Folds one `-progress` line into `current`. Returns a snapshot at the end
/// of each block, which ffmpeg terminates with a `progress=` line.
pub fn parse_progress_line(line: &str, current: &mut TranscodeProgress) -> Option<TranscodeProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Despite its name, out_time_ms is reported in microseconds as well.
        "out_time_us" | "out_time_ms" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_us = us.max(0);
            }
            None
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            Some(current.clone())
        }
        _ => None,
    }
}

#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    /// Renders `request` and returns the path of the finished output.
    ///
    /// Implementations must reject an invalid timing window before starting
    /// any work, and must not leave a partial output behind on failure.
    async fn overlay(&self, request: &OverlayRequest, on_progress: ProgressFn) -> Result<PathBuf>;
}

/// [`MediaTranscoder`] that renders with the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
    video_codec: String,
    preset: String,
    crf: u8,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            video_codec: "libx264".to_string(),
            preset: "medium".to_string(),
            crf: 23,
        }
    }

    pub fn with_encoding(mut self, video_codec: impl Into<String>, preset: impl Into<String>, crf: u8) -> Self {
        self.video_codec = video_codec.into();
        self.preset = preset.into();
        self.crf = crf;
        self
    }

    pub fn check_available(&self) -> Result<PathBuf> {
        which::which(&self.binary).map_err(|_| {
            FramecastError::transcode_failed(format!("{} not found", self.binary.display()))
        })
    }

    pub fn command_for(&self, request: &OverlayRequest) -> OverlayCommand {
        OverlayCommand::for_request(request)
            .video_codec(self.video_codec.clone())
            .preset(self.preset.clone())
            .crf(self.crf)
    }
}

async fn remove_partial_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
    }
}

#[async_trait]
impl MediaTranscoder for FfmpegTranscoder {
    async fn overlay(&self, request: &OverlayRequest, on_progress: ProgressFn) -> Result<PathBuf> {
        request.validate()?;
        let binary = self.check_available()?;

        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let args = self.command_for(request).build_args();
        debug!("Running FFmpeg: {} {}", binary.display(), args.join(" "));

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FramecastError::transcode_failed(format!("Failed to start ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FramecastError::transcode_failed("ffmpeg stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FramecastError::transcode_failed("ffmpeg stderr not captured"))?;

        let expected_duration = request.expected_duration;
        let progress_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut current = TranscodeProgress::default();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(snapshot) = parse_progress_line(&line, &mut current) {
                    match expected_duration {
                        Some(total) => on_progress(snapshot.fraction_of(total)),
                        None if snapshot.is_complete => on_progress(1.0),
                        None => {}
                    }
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let status = child.wait().await;
        let _ = progress_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                remove_partial_output(&request.output_path).await;
                return Err(FramecastError::transcode_failed(format!(
                    "Failed to wait for ffmpeg: {}",
                    e
                )));
            }
        };

        if !status.success() {
            remove_partial_output(&request.output_path).await;
            return Err(FramecastError::transcode_failed(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr_tail.trim()
            )));
        }

        verify_output(&request.output_path).await?;
        info!(output = %request.output_path.display(), "Overlay render finished");
        Ok(request.output_path.clone())
    }
}

/// Checks that a successful run left a non-empty file behind.
async fn verify_output(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(()),
        Ok(metadata) if metadata.is_file() => {
            remove_partial_output(path).await;
            Err(FramecastError::transcode_failed(format!(
                "ffmpeg reported success but {} is empty",
                path.display()
            )))
        }
        _ => Err(FramecastError::transcode_failed(format!(
            "ffmpeg reported success but {} was not written",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OverlayRequest {
        OverlayRequest::new("in/video.mp4", "in/frame.png", 10.0, 5.5, "out/result.mp4")
    }

    #[test]
    fn test_overlay_filter() {
        assert_eq!(
            overlay_filter(10.0, 15.5, Some((1280, 720))),
            "[1:v]scale=1280:720[frame];[0:v][frame]overlay=0:0:enable='between(t,10,15.5)'[v]"
        );
        assert_eq!(
            overlay_filter(0.0, 2.0, None),
            "[0:v][1:v]overlay=0:0:enable='between(t,0,2)'[v]"
        );
    }

    #[test]
    fn test_command_arguments() {
        let transcoder = FfmpegTranscoder::default();
        let args = transcoder
            .command_for(&request().with_frame_size(1920, 1080))
            .build_args();

        let position = |needle: &str| args.iter().position(|a| a == needle);
        assert_eq!(args[0], "-y");
        assert_eq!(args.last().map(String::as_str), Some("out/result.mp4"));

        let video = position("in/video.mp4").unwrap();
        let frame = position("in/frame.png").unwrap();
        assert!(video < frame, "base video must be input 0");

        for expected in ["[v]", "0:a?", "copy", "libx264", "medium", "23", "pipe:1"] {
            assert!(position(expected).is_some(), "missing {}", expected);
        }
        assert!(args.iter().any(|a| a.contains("scale=1920:1080")));
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());
        assert_eq!(request().end_time(), 15.5);

        let negative = OverlayRequest::new("v.mp4", "f.png", -1.0, 5.0, "o.mp4");
        assert!(matches!(negative.validate(), Err(FramecastError::InvalidInput { .. })));

        let empty = OverlayRequest::new("v.mp4", "f.png", 1.0, 0.0, "o.mp4");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_progress_parsing() {
        let mut progress = TranscodeProgress::default();

        assert!(parse_progress_line("frame=120", &mut progress).is_none());
        assert!(parse_progress_line("out_time_us=5000000", &mut progress).is_none());
        assert_eq!(progress.out_time_us, 5_000_000);

        let snapshot = parse_progress_line("progress=continue", &mut progress).unwrap();
        assert!(!snapshot.is_complete);
        assert!((snapshot.fraction_of(20.0) - 0.25).abs() < 1e-9);

        parse_progress_line("out_time_ms=40000000", &mut progress);
        let snapshot = parse_progress_line("progress=continue", &mut progress).unwrap();
        assert_eq!(snapshot.fraction_of(20.0), 1.0);

        let done = parse_progress_line("progress=end", &mut progress).unwrap();
        assert!(done.is_complete);
        assert_eq!(done.fraction_of(0.0), 1.0);
    }

    #[test]
    fn test_negative_position_is_clamped() {
        let mut progress = TranscodeProgress::default();
        parse_progress_line("out_time_us=-23220", &mut progress);
        assert_eq!(progress.out_time_us, 0);
    }

    #[tokio::test]
    async fn test_invalid_timing_rejected_before_spawn() {
        // The binary does not exist, so reaching the spawn would fail differently
        let transcoder = FfmpegTranscoder::new("/nonexistent/bin/ffmpeg-missing");
        let bad = OverlayRequest::new("v.mp4", "f.png", 3.0, -2.0, "o.mp4");
        let err = transcoder.overlay(&bad, Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, FramecastError::InvalidInput { .. }));

        let err = transcoder.overlay(&request(), Box::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, FramecastError::TranscodeFailed { .. }));
    }

    #[tokio::test]
    async fn test_empty_output_is_a_failed_render() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("result.mp4");

        let err = verify_output(&output).await.unwrap_err();
        assert!(err.to_string().contains("was not written"));

        std::fs::write(&output, b"").unwrap();
        let err = verify_output(&output).await.unwrap_err();
        assert!(matches!(err, FramecastError::TranscodeFailed { .. }));
        assert!(err.to_string().contains("is empty"));
        assert!(!output.exists());

        std::fs::write(&output, b"moov").unwrap();
        assert!(verify_output(&output).await.is_ok());
    }
}
