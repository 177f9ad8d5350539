//! Bisectar CLI - first-divergence bisection for paired transformer traces
//!
//! # Commands
//!
//! - `bisect` - Compare two runs given as trace file lists
//! - `guardrail` - Check an experiment matrix directory against a manifest
//! - `determinism` - Compare repeated runs for bit-level determinism
//!
//! Exit codes: 0 pass, 1 gating failure, 2 environment error.

use bisectar::cli::{entrypoint, Cli, EXIT_ERROR};
use clap::Parser;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.effective_log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match entrypoint(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_ERROR);
        },
    }
}
