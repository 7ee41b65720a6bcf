use thiserror::Error;

#[derive(Error, Debug)]
pub enum FramecastError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Unsupported format: {message}")]
    UnsupportedFormat { message: String },

    #[error("Timing out of range: {message}")]
    TimingOutOfRange { message: String },

    #[error("Probe failed: {message}")]
    ProbeFailed { message: String },

    #[error("Video processing failed: {message}")]
    TranscodeFailed { message: String },

    #[error("Job store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Not initialized: {message}")]
    NotInitialized { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Lock on job {id} is no longer held by this worker")]
    LeaseLost { id: String },

    #[error("No handler registered for job type: {name}")]
    UnknownHandler { name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cron error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FramecastError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            message: message.into(),
        }
    }

    pub fn timing_out_of_range(message: impl Into<String>) -> Self {
        Self::TimingOutOfRange {
            message: message.into(),
        }
    }

    pub fn probe_failed(message: impl Into<String>) -> Self {
        Self::ProbeFailed {
            message: message.into(),
        }
    }

    pub fn transcode_failed(message: impl Into<String>) -> Self {
        Self::TranscodeFailed {
            message: message.into(),
        }
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::NotInitialized {
            message: message.into(),
        }
    }

    /// Whether the error came from validating the job against its inputs,
    /// as opposed to infrastructure (store, subprocess plumbing) failing.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::UnsupportedFormat { .. } | Self::TimingOutOfRange { .. }
        )
    }
}

impl From<toml::de::Error> for FramecastError {
    fn from(err: toml::de::Error) -> Self {
        FramecastError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for FramecastError {
    fn from(err: toml::ser::Error) -> Self {
        FramecastError::Config(format!("TOML serialization error: {}", err))
    }
}
