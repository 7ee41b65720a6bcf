use anyhow::Result;
use clap::Subcommand;
use framecast::FramecastConfig;
use std::path::PathBuf;

use super::CommandContext;
use crate::config::{default_config_path, write};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    #[command(about = "Write a configuration file with the default settings")]
    Init {
        #[arg(long, help = "Target file (defaults to the user config directory)")]
        path: Option<PathBuf>,
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
        #[arg(long, help = "Start from the production profile")]
        production: bool,
    },

    #[command(about = "Show the effective configuration")]
    Show {
        #[arg(long, help = "Print as TOML instead of a table")]
        toml: bool,
    },

    #[command(about = "Show the default configuration file path")]
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        match self {
            ConfigCommand::Init {
                path,
                force,
                production,
            } => {
                let path = match path {
                    Some(path) => path.clone(),
                    None => default_config_path()?,
                };
                let config = if *production {
                    FramecastConfig::production()
                } else {
                    FramecastConfig::default()
                };
                write(&config, &path, *force)?;
                println!("✅ Wrote {}", path.display());
            }
            ConfigCommand::Show { toml } => {
                if *toml {
                    print!("{}", toml::to_string_pretty(&ctx.config)?);
                } else {
                    show_config(ctx);
                }
            }
            ConfigCommand::Path => {
                println!("{}", default_config_path()?.display());
            }
        }
        Ok(())
    }
}

fn show_config(ctx: &CommandContext) {
    let config = &ctx.config;
    println!("⚙️  Framecast Configuration ({})", ctx.source);

    let mut table = comfy_table::Table::new();
    table.set_header(vec!["Setting", "Value"]);
    let rows = [
        ("database.url", config.database.url.clone()),
        ("database.pool_size", config.database.pool_size.to_string()),
        ("scheduler.poll_interval", format!("{:?}", config.scheduler.poll_interval)),
        ("scheduler.max_concurrency", config.scheduler.max_concurrency.to_string()),
        ("scheduler.lock_lifetime", format!("{:?}", config.scheduler.lock_lifetime)),
        ("media.ffmpeg_path", config.media.ffmpeg_path.clone()),
        ("media.ffprobe_path", config.media.ffprobe_path.clone()),
        (
            "media.encoding",
            format!(
                "{} preset={} crf={}",
                config.media.video_codec, config.media.preset, config.media.crf
            ),
        ),
        ("cleanup.enabled", config.cleanup.enabled.to_string()),
        (
            "cleanup.schedule",
            format!("{} ({})", config.cleanup.schedule, config.cleanup.timezone),
        ),
        ("cleanup.retention", format!("{:?}", config.cleanup.retention)),
        ("logging.level", config.logging.level.clone()),
    ];
    for (key, value) in rows {
        table.add_row(vec![key.to_string(), value]);
    }
    println!("{}", table);
    println!("\n💡 Priority: FRAMECAST_* environment variables > config file > defaults");
}
