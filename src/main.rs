//! segrep CLI entry point
//!
//! This is a minimal entrypoint that:
//! 1. Parses CLI arguments and dispatches (via cli::run)
//! 2. Reports errors as JSON on stdout and as text on stderr
//! 3. Exits with non-zero on failure
//!
//! All logic is delegated to the CLI module.

use segrep::cli;

fn main() {
    if let Err(e) = cli::run() {
        let _ = cli::write_error(e.code_str(), e.message());
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
