//! CLI argument definitions using clap
//!
//! Commands:
//! - segrep simulate [--config <path>] [options]
//! - segrep check-config --config <path>

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// segrep - drive the segment replication core against a simulated cluster
#[derive(Parser, Debug)]
#[command(name = "segrep")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replicate generated segments onto simulated backups and report
    Simulate(SimulateArgs),

    /// Validate a replication config file and print it
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./segrep.json")]
        config: PathBuf,
    },
}

/// Options for one simulation run
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Replication config file; defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the configured replica count
    #[arg(long)]
    pub replicas: Option<u32>,

    /// Number of simulated backups
    #[arg(long, default_value_t = 5)]
    pub backups: u64,

    /// Number of segments to open
    #[arg(long, default_value_t = 4)]
    pub segments: u64,

    /// Final size of every segment
    #[arg(long, default_value_t = 4096)]
    pub segment_bytes: usize,

    /// Appends after the initial open
    #[arg(long, default_value_t = 3)]
    pub appends: u32,

    /// Probability that any backup request fails
    #[arg(long, default_value_t = 0.0)]
    pub failure_rate: f64,

    /// Seed for segment contents and failure injection
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Polls before a request completes
    #[arg(long, default_value_t = 1)]
    pub latency: u32,

    /// Kill the first backup once this many segments are open
    #[arg(long)]
    pub kill_after: Option<u64>,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            config: None,
            replicas: None,
            backups: 5,
            segments: 4,
            segment_bytes: 4096,
            appends: 3,
            failure_rate: 0.0,
            seed: 1,
            latency: 1,
            kill_after: None,
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
