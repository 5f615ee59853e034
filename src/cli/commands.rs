//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - simulate: drive the scheduler with a synthetic workload
//! - config: print the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tasksched::Priority;

/// tasksched - bounded-concurrency priority task scheduler
#[derive(Parser, Debug)]
#[command(name = "tasksched")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a synthetic workload through the scheduler and report stats
    Simulate(SimulateArgs),

    /// Print the effective configuration as YAML
    Config,
}

/// Options for the simulate subcommand
#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of tasks to enqueue
    #[arg(short = 'n', long, default_value_t = 20)]
    pub tasks: usize,

    /// Probability in [0, 1] that an attempt fails
    #[arg(short, long, default_value_t = 0.2)]
    pub fail_rate: f64,

    /// Override max_concurrency from the config
    #[arg(short = 'j', long)]
    pub max_concurrency: Option<usize>,

    /// Shortest simulated attempt, in milliseconds
    #[arg(long, default_value_t = 10)]
    pub min_ms: u64,

    /// Longest simulated attempt, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub max_ms: u64,

    /// Cancel every task with this tag after the first report
    #[arg(long)]
    pub cancel_tag: Option<String>,

    /// Enqueue every task at this priority instead of a random one
    #[arg(short, long)]
    pub priority: Option<Priority>,

    /// Milliseconds between progress reports
    #[arg(long, default_value_t = 100)]
    pub report_ms: u64,

    /// Print the final stats as JSON
    #[arg(long)]
    pub json: bool,
}
