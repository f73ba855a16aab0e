//! Command-line interface for taskcheck.
//!
//! Provides the `run` command that executes an eval file and the `summary`
//! command that condenses a results file.

mod commands;
mod summary;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
