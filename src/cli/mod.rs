//! CLI module for segrep
//!
//! Provides command-line interface for:
//! - simulate: Replicate generated segments onto a simulated cluster
//! - check-config: Validate a replication config file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, SimulateArgs};
pub use commands::{check_config, run_command, simulate};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}
