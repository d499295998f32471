//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// cbmock - mock Couchbase cluster for SDK testing.
#[derive(Parser, Debug)]
#[command(name = "cbmock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the mock cluster.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
