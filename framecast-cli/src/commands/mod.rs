pub mod config;
pub mod job;
pub mod service;

pub use config::ConfigCommand;
pub use job::JobCommand;
pub use service::ServiceCommand;

use anyhow::{Context, Result};
use framecast::{FramecastConfig, store::postgres::PostgresStore};
use std::time::Duration;

use crate::config::ConfigSource;

/// Settings every command runs with.
pub struct CommandContext {
    pub config: FramecastConfig,
    pub source: ConfigSource,
}

pub async fn connect_store(config: &FramecastConfig) -> Result<PostgresStore> {
    PostgresStore::connect(
        &config.database.url,
        config.database.pool_size,
        Duration::from_secs(config.database.connection_timeout_secs),
    )
    .await
    .with_context(|| format!("Could not connect to {}", config.database.url))
}
