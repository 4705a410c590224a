//! CLI command definitions for the `syard` binary.
//!
//! Uses clap derive macros. Graph files are JSON; run history and
//! checkpoints live in the SQLite database named in `switchyard.toml`.

pub mod checkpoint;
pub mod graph;
pub mod recover;
pub mod runs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::Color;
use switchyard_types::run::{RunStatus, StepStatus};

/// Run and recover dataflow graphs.
#[derive(Parser)]
#[command(name = "syard", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file location.
    #[arg(long, global = true, env = "SWITCHYARD_CONFIG", default_value = switchyard_infra::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Emit JSON log lines instead of human-readable ones.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by `-q` / `-v` / `-vv`.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,switchyard_core=debug,switchyard_infra=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a graph file without running it.
    Validate {
        /// Path to the graph JSON file.
        file: PathBuf,
    },

    /// Run a graph to completion.
    Run {
        /// Path to the graph JSON file.
        file: PathBuf,

        /// JSON file with seed items (an array, or a single object).
        #[arg(long)]
        input: Option<PathBuf>,

        /// Start from this step instead of every entry step.
        #[arg(long)]
        start_step: Option<String>,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    Runs {
        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one run's step results.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Inspect or prune a run's checkpoints.
    Checkpoints {
        #[command(subcommand)]
        action: checkpoint::CheckpointCommand,
    },

    /// Analyze or recover a failed run.
    Recover {
        #[command(subcommand)]
        action: recover::RecoverCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_run_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    raw.parse::<uuid::Uuid>()
        .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid run id"))
}

pub(crate) fn run_status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Succeeded => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::Yellow,
        RunStatus::Running => Color::Cyan,
        RunStatus::Pending => Color::Grey,
    }
}

pub(crate) fn step_status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Succeeded => "succeeded",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}
