//! CLI command definitions and dispatch for the `weaver` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow files are JSON or
//! YAML; the format is picked from the file extension.

pub mod execution;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Compile and run workflow graphs.
#[derive(Parser)]
#[command(name = "weaver", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export node spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Directory containing `weaver.toml` (defaults to the current directory).
    #[arg(long, global = true, env = "WEAVER_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Directory where execution checkpoints are written.
    #[arg(long, global = true, env = "WEAVER_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow file without running it.
    Validate {
        /// Path to a .json, .yaml or .yml workflow file.
        file: PathBuf,
    },

    /// Show the compiled execution plan of a workflow.
    Plan {
        /// Path to a .json, .yaml or .yml workflow file.
        file: PathBuf,
    },

    /// List workflow files in a directory.
    #[command(alias = "ls")]
    List {
        /// Directory to scan.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Run a workflow with the built-in echo activity.
    Run {
        /// Path to a .json, .yaml or .yml workflow file.
        file: PathBuf,

        /// Workflow inputs as a JSON document.
        #[arg(long, short, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read workflow inputs from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Account charged for credits.
        #[arg(long, default_value = weaver_core::workflow::engine::DEFAULT_ACCOUNT)]
        account: String,

        /// Starting credit balance of the account.
        #[arg(long, default_value_t = 1_000_000)]
        balance: u64,
    },

    /// Resume a paused execution from its checkpoint.
    Resume {
        /// Execution id printed when the run was paused.
        execution_id: Uuid,

        /// Starting credit balance of the account.
        #[arg(long, default_value_t = 1_000_000)]
        balance: u64,
    },

    /// List saved execution checkpoints.
    Checkpoints,

    /// Print the JSON Schema of the workflow definition format.
    Schema,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
