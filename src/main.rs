//! cbmock - unified CLI entrypoint.
//!
//! Usage:
//!   cbmock start [--config config/cbmock.toml] [--nodes 4] [--control-port 0]
//!   cbmock config validate --config config/cbmock.toml
//!   cbmock config show [--format json]
//!   cbmock config generate [--output cbmock.toml]

use anyhow::Result;
use clap::Parser;
use cbmock::cli::commands::{run_config, run_start};
use cbmock::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args, cli.log_level).await,
        Commands::Config(args) => run_config(args),
    }
}
