//! Container format recognition.
//!
//! ffprobe reports a comma-separated `format_name` such as
//! `mov,mp4,m4a,3gp,3g2,mj2` or `png_pipe`. A file is accepted when any of
//! those names maps to a supported format for its role.

use super::probe::ProbeReport;
use crate::{FramecastError, Result};
use std::path::Path;

pub const SUPPORTED_VIDEO_FORMATS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

pub const SUPPORTED_IMAGE_FORMATS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// What a file is used for in an overlay job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaRole {
    /// The base video. Must be a supported video container.
    Video,
    /// The overlay frame. A supported image, or a supported video.
    Overlay,
}

impl MediaRole {
    fn label(&self) -> &'static str {
        match self {
            MediaRole::Video => "Video",
            MediaRole::Overlay => "Frame",
        }
    }

    fn accepts(&self, format: &str) -> bool {
        match self {
            MediaRole::Video => SUPPORTED_VIDEO_FORMATS.contains(&format),
            MediaRole::Overlay => {
                SUPPORTED_IMAGE_FORMATS.contains(&format) || SUPPORTED_VIDEO_FORMATS.contains(&format)
            }
        }
    }
}

/// Maps one ffprobe demuxer name to the format name users know.
fn canonical_format(name: &str, path: &Path) -> Option<String> {
    let name = name.trim().to_ascii_lowercase();
    let name = name.strip_suffix("_pipe").unwrap_or(&name);
    match name {
        "matroska" => Some("mkv".to_string()),
        // The generic image sequence demuxer only says "an image"; trust the
        // extension to tell which one.
        "image2" => path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase()),
        other => Some(other.to_string()),
    }
}

/// Checks that a probed file is of a supported format for `role`.
pub fn check_format(report: &ProbeReport, path: &Path, role: MediaRole) -> Result<()> {
    let recognized = report
        .format_name
        .split(',')
        .filter_map(|name| canonical_format(name, path))
        .any(|format| role.accepts(&format));

    if !recognized {
        return Err(FramecastError::unsupported_format(format!(
            "{} format '{}' is not supported",
            role.label(),
            report.format_name
        )));
    }

    // Images probe as a single video stream too
    if !report.has_video_stream() {
        return Err(FramecastError::unsupported_format(format!(
            "{} file contains no video stream",
            role.label()
        )));
    }

    Ok(())
}
