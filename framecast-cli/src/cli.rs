use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{ConfigCommand, JobCommand, ServiceCommand};

#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(about = "Run and inspect the Framecast video overlay queue")]
#[command(version, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Configuration file")]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'u',
        long,
        global = true,
        env = "DATABASE_URL",
        help = "Database connection URL (overrides the config file)"
    )]
    pub database_url: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Suppress output except errors")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(flatten)]
    Service(ServiceCommand),

    #[command(flatten)]
    Job(JobCommand),

    #[command(about = "Configuration file management")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

impl Cli {
    /// The filter level implied by `--verbose` and `--quiet`.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}
