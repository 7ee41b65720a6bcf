use anyhow::Result;
use clap::Subcommand;
use framecast::{Framecast, JobStore};
use tracing::{info, warn};

use super::{CommandContext, connect_store};

#[derive(Subcommand, Debug)]
pub enum ServiceCommand {
    #[command(about = "Create the jobs table and its indexes")]
    InitDb,

    #[command(about = "Run the scheduler until Ctrl-C")]
    Run {
        #[arg(long, help = "Name recorded on job locks (defaults to a generated id)")]
        worker_name: Option<String>,
        #[arg(long, help = "Maximum jobs running at once in this process")]
        max_concurrency: Option<usize>,
        #[arg(long, help = "Start even if ffmpeg or ffprobe cannot be found")]
        skip_tool_check: bool,
    },

    #[command(about = "Check the job store and the media tools")]
    Health,
}

impl ServiceCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        match self {
            ServiceCommand::InitDb => init_db(ctx).await,
            ServiceCommand::Run {
                worker_name,
                max_concurrency,
                skip_tool_check,
            } => run(ctx, worker_name.clone(), *max_concurrency, *skip_tool_check).await,
            ServiceCommand::Health => health(ctx).await,
        }
    }
}

async fn init_db(ctx: &CommandContext) -> Result<()> {
    let store = connect_store(&ctx.config).await?;
    store.create_tables().await?;
    println!("✅ Job tables ready");
    Ok(())
}

async fn run(
    ctx: &CommandContext,
    worker_name: Option<String>,
    max_concurrency: Option<usize>,
    skip_tool_check: bool,
) -> Result<()> {
    let mut config = ctx.config.clone();
    if worker_name.is_some() {
        config.scheduler.worker_name = worker_name;
    }
    if let Some(max) = max_concurrency {
        config = config.with_max_concurrency(max);
    }

    match Framecast::check_media_tools(&config) {
        Ok(()) => {}
        Err(e) if skip_tool_check => warn!("Media tools unavailable: {}", e),
        Err(e) => return Err(e.into()),
    }

    info!("🚀 Starting Framecast (config: {})", ctx.source);
    let app = Framecast::connect(config).await?;
    app.start().await?;
    info!(
        worker = %app.scheduler().worker_id(),
        "Scheduler running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down, waiting for running jobs");
    app.shutdown().await?;
    Ok(())
}

async fn health(ctx: &CommandContext) -> Result<()> {
    let mut table = comfy_table::Table::new();
    table.set_header(vec!["Component", "Status", "Detail"]);
    let mut healthy = true;

    match connect_store(&ctx.config).await {
        Ok(store) => {
            let ok = store.health_check().await;
            healthy &= ok;
            table.add_row(vec![
                "job store",
                if ok { "🟢 ok" } else { "🔴 down" },
                ctx.config.database.url.as_str(),
            ]);
        }
        Err(e) => {
            healthy = false;
            table.add_row(vec!["job store".to_string(), "🔴 down".to_string(), format!("{:#}", e)]);
        }
    }

    match Framecast::check_media_tools(&ctx.config) {
        Ok(()) => {
            table.add_row(vec!["ffmpeg / ffprobe", "🟢 ok", "available"]);
        }
        Err(e) => {
            healthy = false;
            table.add_row(vec!["ffmpeg / ffprobe".to_string(), "🔴 missing".to_string(), e.to_string()]);
        }
    }

    println!("{}", table);
    if !healthy {
        anyhow::bail!("Framecast is not healthy");
    }
    Ok(())
}
