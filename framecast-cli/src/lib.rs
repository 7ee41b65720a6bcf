//! # Framecast CLI
//!
//! The `framecast` binary runs the overlay scheduler and talks to its job
//! store from the command line.
//!
//! ## Basic Usage
//!
//! ```bash
//! # Create the jobs table
//! framecast init-db --database-url postgresql://localhost/framecast
//!
//! # Run the scheduler until Ctrl-C
//! framecast run
//!
//! # Queue a job and follow it
//! framecast enqueue --video /uploads/clip.mp4 --frame /uploads/frame.png \
//!   --start 10 --duration 5 --output /outputs/clip.mp4 --user user-1 --job-id job-1
//! framecast status job-1
//! framecast result job-1
//!
//! # A user's latest jobs
//! framecast jobs user-1 --limit 5
//! ```
//!
//! ## Configuration
//!
//! Settings are read from `--config`, or from `framecast/config.toml` under the
//! user's config directory when it exists, then overridden by `FRAMECAST_*`
//! environment variables. `framecast config init` writes a file with the
//! defaults.

pub mod cli;
pub mod commands;
pub mod config;
pub mod display;
