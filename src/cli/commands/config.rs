//! Config command implementation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::core::config::Config;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/cbmock.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path. Defaults only when absent.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Write a commented configuration template.
    Generate {
        /// Output file path. Prints to stdout when absent.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(config.as_deref(), &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;

    println!("✓ Config file is valid");
    println!(
        "  {} bucket(s), {} node(s) each, {} replica(s), {} vbuckets",
        config.buckets.len(),
        config.cluster.nodes,
        config.cluster.replicas,
        config.cluster.vbuckets
    );
    if config.cluster.control_port.is_none() {
        println!("  ⚠ Warning: control channel disabled (cluster.control_port not set)");
    }
    Ok(())
}

fn show_config(path: Option<&Path>, format: &str) -> Result<()> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let rendered = match format {
        "json" => serde_json::to_string_pretty(&config)?,
        "toml" => toml::to_string_pretty(&config).context("failed to render config as TOML")?,
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    };
    println!("{}", rendered);
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = template();
    match output {
        Some(path) => {
            std::fs::write(path, template)
                .with_context(|| format!("failed to write {:?}", path))?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn template() -> &'static str {
    r#"# cbmock configuration

[cluster]
nodes = 4
replicas = 2
vbuckets = 32
host = "127.0.0.1"
# First node port; nodes of later buckets follow on. 0 picks ephemeral ports.
base_port = 0
# Uncomment to enable the control channel (0 picks an ephemeral port).
# control_port = 18091

[[buckets]]
name = "default"
password = ""
type = "couchbase"

# [[buckets]]
# name = "memcache"
# password = "secret"
# type = "memcached"

[server]
max_value_size = 20971520
max_connections = 1024
cccp = true
enhanced_errors = false
compression = "off"

[logging]
level = "info"
format = "text"
"#
}
