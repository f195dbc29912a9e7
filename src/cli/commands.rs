use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// `evergreen` - keeps container base images in build manifests current.
#[derive(Parser, Debug)]
#[command(name = "evergreen")]
#[command(version)]
#[command(
    about = "Proposes base image updates for Dockerfiles as merge requests.",
    long_about = None
)]
pub struct Cli {
    /// Config file (default: ~/.evergreen/config.toml, created on first use)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one update cycle: scan, plan, patch, push and open a merge request
    Run {
        /// Plan only; leave files, branches and merge requests untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// Keep running update cycles on a schedule until interrupted
    Watch {
        /// Pause between runs in seconds (overrides watch.interval_secs)
        #[arg(long, conflicts_with = "cron")]
        interval_secs: Option<u64>,

        /// Cron expression, 5 or 6 fields, UTC (overrides watch.cron)
        #[arg(long)]
        cron: Option<String>,

        /// Start the first run immediately instead of waiting one period
        /// (overrides watch.run_on_startup; `--run-on-startup=false` disables)
        #[arg(long, num_args = 0..=1, default_missing_value = "true", require_equals = true)]
        run_on_startup: Option<bool>,

        /// Plan only on every cycle
        #[arg(long)]
        dry_run: bool,
    },

    /// Serve webhook triggers and run status over HTTP until interrupted
    Serve {
        /// Bind host (overrides webhook.host)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides webhook.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List every base image reference found under the scan root
    Scan,

    /// Show the edits a run would make, without taking the run lock
    Plan,

    /// Show configuration, lock holder and recent run history
    Status,

    /// Clear a stale run lock
    Unlock {
        /// Clear the lock even if its holder still looks alive
        #[arg(long)]
        force: bool,
    },
}
