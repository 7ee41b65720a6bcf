use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use framecast_cli::cli::{Cli, Commands};
use framecast_cli::commands::CommandContext;
use framecast_cli::config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let result = execute(&cli).await;
    if let Err(e) = result {
        error!("❌ Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level();
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("framecast_cli={}", log_level).parse()?)
        .add_directive(format!("framecast={}", log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .init();

    Ok(())
}

async fn execute(cli: &Cli) -> Result<()> {
    let (mut framecast_config, source) = config::load(cli.config.as_deref())?;
    if let Some(url) = &cli.database_url {
        framecast_config.database.url = url.clone();
    }
    debug!("Using configuration from {}", source);

    let ctx = CommandContext {
        config: framecast_config,
        source,
    };

    match &cli.command {
        Commands::Service(command) => command.execute(&ctx).await,
        Commands::Job(command) => command.execute(&ctx).await,
        Commands::Config { command } => command.execute(&ctx).await,
    }
}
