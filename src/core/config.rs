//! Configuration parsing and validation.
//!
//! The mock is configured from a TOML file with CLI overrides. Every section
//! has defaults, so an empty file starts a four-node cluster with a single
//! password-less couchbase bucket named `default`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::control::placement::REPLICAS_MAX;

/// Top-level mock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster shape and addresses.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Buckets served by every node.
    #[serde(default = "default_buckets")]
    pub buckets: Vec<BucketConfig>,

    /// Protocol server behavior.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            buckets: default_buckets(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Cluster shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Nodes per bucket.
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Replicas per vbucket.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// VBuckets per bucket. Must be a power of two.
    #[serde(default = "default_vbuckets")]
    pub vbuckets: usize,

    /// Address nodes bind to and advertise.
    #[serde(default = "default_host")]
    pub host: String,

    /// First node port. Zero picks ephemeral ports.
    #[serde(default)]
    pub base_port: u16,

    /// Control channel port. `None` disables it, zero picks an ephemeral port.
    #[serde(default)]
    pub control_port: Option<u16>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            replicas: default_replicas(),
            vbuckets: default_vbuckets(),
            host: default_host(),
            base_port: 0,
            control_port: None,
        }
    }
}

/// Bucket flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    /// VBucket-aware bucket with replicas and persistence.
    Couchbase,
    /// Plain cache without vbucket ownership.
    Memcached,
}

impl std::fmt::Display for BucketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Couchbase => write!(f, "couchbase"),
            Self::Memcached => write!(f, "memcached"),
        }
    }
}

/// One bucket definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,

    /// SASL password. Empty means connections start authenticated.
    #[serde(default)]
    pub password: String,

    #[serde(rename = "type", default = "default_bucket_type")]
    pub bucket_type: BucketType,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>, password: impl Into<String>, bucket_type: BucketType) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            bucket_type,
        }
    }
}

/// Snappy negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// SNAPPY is never negotiated.
    #[default]
    Off,
    /// Compressed values are accepted and stored as sent.
    Passive,
    /// Same as passive; compressed values are returned as stored.
    Active,
}

impl std::str::FromStr for CompressionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "disabled" => Ok(Self::Off),
            "passive" => Ok(Self::Passive),
            "active" => Ok(Self::Active),
            other => anyhow::bail!("unknown compression mode: {}", other),
        }
    }
}

/// Protocol server behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Largest value accepted by storage commands.
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,

    /// Concurrent client connections per node.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Serve the cluster map over the memcached port.
    #[serde(default = "default_true")]
    pub cccp: bool,

    /// Attach an error reference to every failed response.
    #[serde(default)]
    pub enhanced_errors: bool,

    #[serde(default)]
    pub compression: CompressionMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_value_size: default_max_value_size(),
            max_connections: default_max_connections(),
            cccp: true,
            enhanced_errors: false,
            compression: CompressionMode::Off,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions

fn default_buckets() -> Vec<BucketConfig> {
    vec![BucketConfig::new("default", "", BucketType::Couchbase)]
}

fn default_nodes() -> usize {
    4
}

fn default_replicas() -> usize {
    2
}

fn default_vbuckets() -> usize {
    32
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bucket_type() -> BucketType {
    BucketType::Couchbase
}

fn default_max_value_size() -> usize {
    20 * 1024 * 1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }
        if let Some(nodes) = overrides.nodes {
            self.cluster.nodes = nodes;
        }
        if let Some(replicas) = overrides.replicas {
            self.cluster.replicas = replicas;
        }
        if let Some(vbuckets) = overrides.vbuckets {
            self.cluster.vbuckets = vbuckets;
        }
        if let Some(port) = overrides.base_port {
            self.cluster.base_port = port;
        }
        if let Some(port) = overrides.control_port {
            self.cluster.control_port = Some(port);
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_cluster()?;
        self.validate_buckets()?;
        self.validate_server()?;
        self.validate_logging()?;
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.nodes == 0 {
            anyhow::bail!("cluster.nodes must be > 0");
        }
        if self.cluster.replicas > REPLICAS_MAX {
            anyhow::bail!(
                "cluster.replicas must be <= {}, got: {}",
                REPLICAS_MAX,
                self.cluster.replicas
            );
        }
        if self.cluster.vbuckets == 0
            || !self.cluster.vbuckets.is_power_of_two()
            || self.cluster.vbuckets > u16::MAX as usize
        {
            anyhow::bail!(
                "cluster.vbuckets must be a power of two between 1 and 32768, got: {}",
                self.cluster.vbuckets
            );
        }
        if self.cluster.host.is_empty() {
            anyhow::bail!("cluster.host must not be empty");
        }
        Ok(())
    }

    fn validate_buckets(&self) -> Result<()> {
        if self.buckets.is_empty() {
            anyhow::bail!("at least one bucket is required");
        }
        let mut seen = std::collections::HashSet::new();
        for bucket in &self.buckets {
            if bucket.name.is_empty() {
                anyhow::bail!("bucket name must not be empty");
            }
            if !seen.insert(bucket.name.as_str()) {
                anyhow::bail!("duplicate bucket name: {}", bucket.name);
            }
        }
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if self.server.max_value_size == 0 {
            anyhow::bail!("server.max_value_size must be > 0");
        }
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be > 0");
        }
        Ok(())
    }

    fn validate_logging(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "logging.level must be one of {:?}, got: {}",
                valid_levels,
                self.logging.level
            );
        }
        if self.logging.format != "text" && self.logging.format != "json" {
            anyhow::bail!(
                "logging.format must be 'text' or 'json', got: {}",
                self.logging.format
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override node count.
    pub nodes: Option<usize>,
    /// Override replica count.
    pub replicas: Option<usize>,
    /// Override vbucket count.
    pub vbuckets: Option<usize>,
    /// Override first node port.
    pub base_port: Option<u16>,
    /// Enable the control channel on this port.
    pub control_port: Option<u16>,
}
