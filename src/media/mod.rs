//! Media inspection and transcoding through the ffmpeg toolchain.
//!
//! Both external tools sit behind traits ([`MediaProbe`], [`MediaTranscoder`])
//! so the orchestrator can be driven by in-process fakes in tests.

pub mod format;
pub mod probe;
pub mod transcode;

pub use format::{MediaRole, SUPPORTED_IMAGE_FORMATS, SUPPORTED_VIDEO_FORMATS};
pub use probe::{FfprobeProbe, MediaProbe, ProbeReport, StreamInfo, VideoMetadata};
pub use transcode::{
    FfmpegTranscoder, MediaTranscoder, OverlayCommand, OverlayRequest, ProgressFn, TranscodeProgress,
};
