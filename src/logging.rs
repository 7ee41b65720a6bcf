//! Log output setup.
//!
//! Framecast logs through `tracing`; this module installs a `tracing-subscriber`
//! formatter for binaries that do not bring their own. `RUST_LOG` takes
//! precedence over the configured level.

use crate::{FramecastError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Builds the filter from `RUST_LOG`, falling back to `config.level`.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            FramecastError::Config(format!("Invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| FramecastError::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_config_error() {
        // Only meaningful when RUST_LOG does not override the level
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "framecast=notalevel".to_string(),
            ..Default::default()
        };
        assert!(matches!(env_filter(&config), Err(FramecastError::Config(_))));
    }

    #[test]
    fn test_directive_level_accepted() {
        let config = LoggingConfig {
            level: "info,framecast=debug".to_string(),
            ..Default::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
