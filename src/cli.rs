//! CLI definitions for the job service.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Distributed job service.
#[derive(Parser)]
#[command(name = "jobservice")]
#[command(about = "Queued, delayed and cron-driven jobs over a shared KV store")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/jobservice.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run a worker pool in the foreground (default)
    Run {
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Submit one job and print its stats record
    Launch {
        /// Registered job name
        name: String,

        /// Job parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Run once after this many seconds
        #[arg(long, conflicts_with = "cron")]
        delay: Option<u64>,

        /// Run on this 6-field cron schedule
        #[arg(long)]
        cron: Option<String>,

        /// Reject the job while an identical one is pending or running
        #[arg(long)]
        unique: bool,

        /// Status hook URL
        #[arg(long)]
        hook: Option<String>,
    },

    /// Apply an action (stop, cancel, retry) to a job
    Action {
        job_id: String,

        action: String,
    },

    /// Print a job's stats record
    Get { job_id: String },

    /// Print the worker pools of the namespace
    Status,

    /// Remove outdated delayed entries and expired job logs
    Sweep,

    /// Validate the configuration file
    ValidateConfig,
}
