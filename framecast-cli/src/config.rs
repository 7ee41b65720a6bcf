use anyhow::{Context, Result};
use framecast::FramecastConfig;
use std::path::{Path, PathBuf};

/// `framecast/config.toml` under the user's config directory.
pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot find config directory"))?;

    path.push("framecast");
    path.push("config.toml");
    Ok(path)
}

/// Where the configuration was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Loads the configuration file, then applies `FRAMECAST_*` variables.
///
/// An explicit `path` must exist. Without one the default location is used
/// if present, otherwise the built-in defaults.
pub fn load(path: Option<&Path>) -> Result<(FramecastConfig, ConfigSource)> {
    let (mut config, source) = match path {
        Some(path) => (read_file(path)?, ConfigSource::File(path.to_path_buf())),
        None => {
            let default_path = default_config_path()?;
            if default_path.exists() {
                (read_file(&default_path)?, ConfigSource::File(default_path))
            } else {
                (FramecastConfig::default(), ConfigSource::Defaults)
            }
        }
    };

    config
        .apply_env()
        .context("Invalid FRAMECAST_* environment variable")?;
    Ok((config, source))
}

fn read_file(path: &Path) -> Result<FramecastConfig> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Config path is not valid UTF-8: {}", path.display()))?;
    FramecastConfig::from_file(path_str)
        .with_context(|| format!("Failed to read config file {}", path.display()))
}

/// Writes `config` to `path`, creating parent directories. Refuses to
/// overwrite an existing file unless `force` is set.
pub fn write(config: &FramecastConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
