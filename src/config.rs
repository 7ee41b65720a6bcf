//! Configuration management for Framecast.
//!
//! Settings are grouped by concern and can be loaded from a TOML file, from
//! `FRAMECAST_*` environment variables, or built in code. Durations are written
//! as human-readable strings such as `"10s"`, `"10m"` or `"7d"`.
//!
//! ```toml
//! [database]
//! url = "postgresql://localhost/framecast"
//!
//! [scheduler]
//! poll_interval = "10s"
//! max_concurrency = 3
//!
//! [cleanup]
//! schedule = "0 2 * * *"
//! retention = "7d"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Module for serializing std::time::Duration as human-readable strings
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else if secs == 0 {
            serializer.serialize_str("0s")
        } else if secs % 86400 == 0 {
            serializer.serialize_str(&format!("{}d", secs / 86400))
        } else if secs % 3600 == 0 {
            serializer.serialize_str(&format!("{}h", secs / 3600))
        } else if secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{}s", secs))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    /// Parse a duration string like "500ms", "30s", "5m", "1h", "7d" or "90".
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("Invalid number in duration: {}", millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let unit = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    suffix
                ));
            }
        };
        num.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration too large: {}", s))
    }
}

pub use duration_secs::parse_duration;

/// Main configuration for a Framecast service.
///
/// ```rust
/// use framecast::config::FramecastConfig;
/// use std::time::Duration;
///
/// let config = FramecastConfig::new()
///     .with_database_url("postgresql://localhost/framecast")
///     .with_poll_interval(Duration::from_secs(5));
///
/// assert_eq!(config.scheduler.max_concurrency, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FramecastConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub media: MediaConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

impl FramecastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler.poll_interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.scheduler.max_concurrency = max_concurrency;
        self
    }

    pub fn with_cleanup_enabled(mut self, enabled: bool) -> Self {
        self.cleanup.enabled = enabled;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overrides fields for which a `FRAMECAST_*` variable is set.
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("FRAMECAST_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(pool_size) = std::env::var("FRAMECAST_DATABASE_POOL_SIZE") {
            self.database.pool_size = pool_size.parse().unwrap_or(self.database.pool_size);
        }

        if let Some(interval) = env_duration("FRAMECAST_POLL_INTERVAL")? {
            self.scheduler.poll_interval = interval;
        }
        if let Ok(max) = std::env::var("FRAMECAST_MAX_CONCURRENCY") {
            self.scheduler.max_concurrency = max.parse().unwrap_or(self.scheduler.max_concurrency);
        }
        if let Some(lifetime) = env_duration("FRAMECAST_LOCK_LIFETIME")? {
            self.scheduler.lock_lifetime = lifetime;
        }
        if let Ok(name) = std::env::var("FRAMECAST_WORKER_NAME") {
            self.scheduler.worker_name = Some(name);
        }

        if let Ok(path) = std::env::var("FRAMECAST_FFMPEG_PATH") {
            self.media.ffmpeg_path = path;
        }
        if let Ok(path) = std::env::var("FRAMECAST_FFPROBE_PATH") {
            self.media.ffprobe_path = path;
        }

        if let Ok(enabled) = std::env::var("FRAMECAST_CLEANUP_ENABLED") {
            self.cleanup.enabled = enabled.parse().unwrap_or(self.cleanup.enabled);
        }
        if let Some(retention) = env_duration("FRAMECAST_CLEANUP_RETENTION")? {
            self.cleanup.retention = retention;
        }

        if let Ok(level) = std::env::var("FRAMECAST_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("FRAMECAST_LOG_JSON") {
            self.logging.json_format = json.parse().unwrap_or(self.logging.json_format);
        }

        Ok(())
    }

    /// Checks the settings a running service depends on.
    pub fn validate(&self) -> crate::Result<()> {
        self.scheduler.validate()?;
        if self.cleanup.enabled {
            crate::cron::CronSchedule::with_timezone(&self.cleanup.schedule, &self.cleanup.timezone)?;
        }
        Ok(())
    }

    /// Create a configuration for development use
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/framecast_dev".to_string(),
                pool_size: 5,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_secs(1),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for production use
    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                create_tables: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_duration(name: &str) -> crate::Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => parse_duration(&value)
            .map(Some)
            .map_err(|e| crate::FramecastError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Whether to create tables if they don't exist
    pub create_tables: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/framecast".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            create_tables: true,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the store is polled for due jobs
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Jobs this process runs at the same time, across all handlers
    pub max_concurrency: usize,

    /// Per-handler cap for definitions that do not set their own
    pub default_concurrency: u32,

    /// Age after which a lock is considered abandoned
    #[serde(with = "duration_secs")]
    pub lock_lifetime: Duration,

    /// Upper bound on start-up work before the scheduler gives up
    #[serde(with = "duration_secs")]
    pub start_timeout: Duration,

    /// How long shutdown waits for in-flight jobs
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Whether progress writes also refresh the job's lock
    pub heartbeat_on_progress: bool,

    /// Identity written to claimed jobs; generated when unset
    pub worker_name: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_concurrency: 3,
            default_concurrency: 1,
            lock_lifetime: Duration::from_secs(600), // 10 minutes
            start_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(600),
            heartbeat_on_progress: true,
            worker_name: None,
        }
    }
}

impl SchedulerConfig {
    /// Rejects settings the poll loop cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let durations = [
            ("poll_interval", self.poll_interval),
            ("lock_lifetime", self.lock_lifetime),
            ("start_timeout", self.start_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(crate::FramecastError::Config(format!(
                    "scheduler.{} must be greater than zero",
                    name
                )));
            }
        }
        if self.max_concurrency == 0 {
            return Err(crate::FramecastError::Config(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// External tool and encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,

    /// Upper bound for a single ffprobe call
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            video_codec: "libx264".to_string(),
            preset: "medium".to_string(),
            crf: 23,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// Nightly maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,

    /// Cron expression, five or six fields
    pub schedule: String,

    /// Timezone the schedule is evaluated in
    pub timezone: String,

    /// Finished jobs older than this are removed together with their output
    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// Whether output files of removed jobs are deleted as well
    pub delete_outputs: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: crate::cron::presets::DAILY_AT_2AM.to_string(),
            timezone: "UTC".to_string(),
            retention: Duration::from_secs(7 * 86400),
            delete_outputs: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,

    /// Whether to include the event target
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            include_target: true,
        }
    }
}
