//! Start command implementation.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::{Runtime, RuntimeOptions};

/// Start the mock cluster.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Config file path. Defaults apply when absent.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Nodes per bucket.
    #[arg(long)]
    pub nodes: Option<usize>,

    /// Replicas per vbucket.
    #[arg(long)]
    pub replicas: Option<usize>,

    /// VBuckets per bucket.
    #[arg(long)]
    pub vbuckets: Option<usize>,

    /// First node port (0 for ephemeral ports).
    #[arg(long)]
    pub port: Option<u16>,

    /// Control channel port (0 for an ephemeral port).
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Harness address the control channel connects to.
    #[arg(long)]
    pub harness: Option<SocketAddr>,
}

impl StartArgs {
    fn overrides(&self, log_level: Option<String>) -> ConfigOverrides {
        ConfigOverrides {
            log_level,
            nodes: self.nodes,
            replicas: self.replicas,
            vbuckets: self.vbuckets,
            base_port: self.port,
            control_port: self.control_port,
        }
    }
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_config: &Config) {}

/// Load the config, apply flags and run until interrupted.
pub async fn run_start(args: StartArgs, log_level: Option<String>) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    config.apply_overrides(&args.overrides(log_level));

    init_tracing(&config);

    let options = RuntimeOptions {
        harness_addr: args.harness,
    };
    let mut runtime = Runtime::with_options(config, options)?;
    runtime.run().await
}
