//! FFprobe media inspection.

use crate::{FramecastError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Primary video stream of a probed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
}

/// What ffprobe reported about a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Comma-separated demuxer names, e.g. `mov,mp4,m4a,3gp,3g2,mj2`.
    pub format_name: String,
    /// Container duration in seconds.
    pub duration: Option<f64>,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub video_stream: Option<StreamInfo>,
}

impl ProbeReport {
    pub fn has_video_stream(&self) -> bool {
        self.video_stream.is_some()
    }

    /// Extracts the metadata the overlay step depends on.
    pub fn video_metadata(&self) -> Result<VideoMetadata> {
        let stream = self
            .video_stream
            .as_ref()
            .ok_or_else(|| FramecastError::probe_failed("No video stream found"))?;

        let metadata = VideoMetadata {
            duration: self.duration.unwrap_or(0.0),
            width: stream.width,
            height: stream.height,
            format: self.format_name.clone(),
            bitrate: self.bitrate.unwrap_or(0),
        };
        metadata.validate()?;
        Ok(metadata)
    }
}

/// Facts about the base video used for timing and scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Bits per second, 0 when unknown
    pub bitrate: u64,
}

impl VideoMetadata {
    pub fn validate(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(FramecastError::probe_failed(format!(
                "Invalid video duration: {}",
                self.duration
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(FramecastError::probe_failed(format!(
                "Invalid video dimensions: {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Inspects a media file.
///
/// A file the tool cannot decode fails with `UnsupportedFormat`. A tool that
/// is missing, cannot be started or times out fails with `ProbeFailed`.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport>;
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Parses the output of `ffprobe -print_format json -show_format -show_streams`.
pub fn parse_ffprobe_json(bytes: &[u8]) -> Result<ProbeReport> {
    let output: FfprobeOutput = serde_json::from_slice(bytes)
        .map_err(|e| FramecastError::probe_failed(format!("Unreadable ffprobe output: {}", e)))?;

    let format = output
        .format
        .ok_or_else(|| FramecastError::unsupported_format("ffprobe reported no container format"))?;

    let video_stream = output
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .map(|s| StreamInfo {
            codec: s.codec_name.unwrap_or_default(),
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
        });

    Ok(ProbeReport {
        format_name: format.format_name.unwrap_or_default(),
        duration: format.duration.and_then(|d| d.parse::<f64>().ok()),
        bitrate: format.bit_rate.and_then(|b| b.parse::<u64>().ok()),
        video_stream,
    })
}

/// [`MediaProbe`] that shells out to ffprobe.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves the binary on `PATH`.
    pub fn check_available(&self) -> Result<PathBuf> {
        which::which(&self.binary).map_err(|_| {
            FramecastError::probe_failed(format!("{} not found", self.binary.display()))
        })
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let binary = self.check_available()?;
        debug!(path = %path.display(), "Probing media file");

        let mut command = Command::new(binary);
        command
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                FramecastError::probe_failed(format!(
                    "ffprobe timed out after {}s on {}",
                    self.timeout.as_secs(),
                    path.display()
                ))
            })?
            .map_err(|e| FramecastError::probe_failed(format!("Failed to run ffprobe: {}", e)))?;

        // ffprobe ran but could not decode the file
        if !output.status.success() {
            return Err(FramecastError::unsupported_format(format!(
                "ffprobe exited with {} for {}: {}",
                output.status,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_ffprobe_json(&output.stdout)
    }
}
