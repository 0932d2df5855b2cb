//! CLI module for vstore
//!
//! Provides command-line interface for:
//! - init: Create the data directory layout
//! - stores: List stores and versions
//! - inspect: Show one store

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{init, inspect, run, run_command, stores};
pub use errors::{CliError, CliErrorCode, CliResult};
