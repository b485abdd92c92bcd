use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use smtr_capture::IfExists;

#[derive(Debug, Parser)]
#[command(
    name = "smtr-pipelines",
    version,
    about = "Capture, recapture and materialize transit data"
)]
pub struct Cli {
    /// Config file (falls back to ./smtr.toml).
    #[arg(long, global = true, env = "SMTR_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Overrides of the `[run]` config section.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Target environment: prod or dev.
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Orchestrator deployment name; `*--prod` targets prod.
    #[arg(long, global = true, env = "SMTR_DEPLOYMENT_NAME")]
    pub deployment_name: Option<String>,

    /// Running on a developer machine.
    #[arg(long, global = true)]
    pub local: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the resolved run environment.
    Env,

    /// Show the partition and file locations of one capture.
    Context {
        /// Source table id.
        table_id: String,

        /// Capture instant (defaults to now, truncated to the minute).
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// List the missing captures of a source, newest first.
    Plan {
        table_id: String,

        /// Window start; without it the last `--days` days are checked.
        #[arg(long)]
        start: Option<String>,

        /// Window end (defaults to the scheduled instant).
        #[arg(long)]
        end: Option<String>,

        /// Lookback in days (defaults to `capture.recapture_days`).
        #[arg(long)]
        days: Option<i64>,

        /// Cap on the number of timestamps returned.
        #[arg(long)]
        cap: Option<usize>,

        /// Use the cap of historical backfills.
        #[arg(long, conflicts_with = "cap")]
        historical: bool,
    },

    /// Extract, stage and upload one source.
    Capture(CaptureArgs),

    /// Run the dbt selector over its next window.
    Materialize(MaterializeArgs),

    /// Send debt registration payloads built from exported rows.
    Post(PostArgs),
}

#[derive(Debug, Args)]
pub struct CaptureArgs {
    pub table_id: String,

    /// Scheduled instant (defaults to now, truncated to the minute).
    #[arg(long)]
    pub timestamp: Option<String>,

    /// Capture missing timestamps instead of the scheduled one.
    #[arg(long)]
    pub recapture: bool,

    /// Lookback of the recapture planner.
    #[arg(long, requires = "recapture")]
    pub recapture_days: Option<i64>,

    /// Explicit instants to recapture, comma separated.
    #[arg(long, value_delimiter = ',', requires = "recapture")]
    pub recapture_timestamps: Option<Vec<String>>,

    /// Cap on planned recaptures.
    #[arg(long, requires = "recapture")]
    pub cap: Option<usize>,

    /// JSON object handed to the extractor.
    #[arg(long)]
    pub extra_parameters: Option<String>,

    /// Endpoint override for the HTTP extractor.
    #[arg(long)]
    pub url: Option<String>,

    #[arg(long, default_value = "replace")]
    pub if_exists: IfExists,
}

#[derive(Debug, Args)]
pub struct MaterializeArgs {
    pub selector: String,

    #[arg(long)]
    pub start: Option<String>,

    #[arg(long)]
    pub end: Option<String>,

    /// Scheduled instant (defaults to now, truncated to the minute).
    #[arg(long)]
    pub timestamp: Option<String>,

    #[arg(long)]
    pub skip_source_check: bool,

    /// Run the post-run tests regardless of their schedule.
    #[arg(long)]
    pub force_test: bool,

    /// JSON object of additional dbt vars.
    #[arg(long)]
    pub vars: Option<String>,

    #[arg(long)]
    pub dry_run: bool,

    /// Extra dbt flags, after `--`.
    #[arg(last = true)]
    pub flags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct PostArgs {
    /// Endpoint receiving the payloads.
    #[arg(long)]
    pub url: String,

    /// JSON file holding an array of row objects.
    #[arg(long)]
    pub rows: PathBuf,

    /// Execution date `YYYY-MM-DD` (defaults to the scheduled date).
    #[arg(long)]
    pub date: Option<String>,

    /// `NAME=VALUE`, repeatable.
    #[arg(long = "header")]
    pub headers: Vec<String>,

    /// Defaults to `integration.max_concurrent`.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Defaults to `integration.timeout_secs`.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Print the payloads without sending them.
    #[arg(long)]
    pub dry_run: bool,
}
