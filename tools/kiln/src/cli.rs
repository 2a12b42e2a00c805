//! Command-line interface definitions for kiln.

use clap::{Parser, Subcommand};

/// Scriptable task-graph build driver.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Suppress progress and command output; show only errors and the summary.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose output with rule resolution, commands and timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Maximum number of concurrent external commands (0 = auto-detect from CPU count).
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Build targets (default: the targets the script wants).
    Build(BuildArgs),
    /// List registered rules and wanted targets.
    List,
    /// Show which rule a target resolves to and its captures.
    Explain(ExplainArgs),
}

/// Arguments for the `build` subcommand.
#[derive(Parser)]
pub struct BuildArgs {
    /// Targets to build.
    pub targets: Vec<String>,
}

/// Arguments for the `explain` subcommand.
#[derive(Parser)]
pub struct ExplainArgs {
    /// Target to resolve.
    pub target: String,
}
