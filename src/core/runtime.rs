//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: cluster → node listeners → control listener
//! - Shutdown order: control listener → node listeners → cluster

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::adapters::memcached::commands::Dispatcher;
use crate::adapters::memcached::{NodeServer, NodeServerConfig};
use crate::adapters::{Adapter, AdapterRegistry};
use crate::control::api::ControlHandler;
use crate::control::cluster::Cluster;
use crate::core::config::Config;
use crate::net::{ControlListener, ControlListenerConfig};

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is not configured.
    Disabled,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Buckets, nodes and vbucket maps.
    pub cluster: ComponentHealth,
    /// Per-node memcached listeners.
    pub nodes: ComponentHealth,
    /// Control channel listener.
    pub control: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            cluster: ComponentHealth::Starting,
            nodes: ComponentHealth::Starting,
            control: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.cluster, self.nodes, self.control),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Disabled
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        ![self.cluster, self.nodes, self.control].contains(&ComponentHealth::Failed)
    }
}

/// Extra runtime options that do not live in the config file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Harness address the control channel dials on start.
    pub harness_addr: Option<SocketAddr>,
}

/// Mock runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    options: RuntimeOptions,
    cluster: Option<Arc<Cluster>>,
    node_servers: Vec<Arc<NodeServer>>,
    control: Option<Arc<ControlListener>>,
    registry: AdapterRegistry,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_options(config, RuntimeOptions::default())
    }

    pub fn with_options(config: Config, options: RuntimeOptions) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            options,
            cluster: None,
            node_servers: Vec::new(),
            control: None,
            registry: AdapterRegistry::new(),
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The cluster, once initialized.
    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    pub fn node_servers(&self) -> &[Arc<NodeServer>] {
        &self.node_servers
    }

    /// Bound address of the control channel, if enabled and started.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().and_then(|c| c.local_addr())
    }

    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            nodes = self.config.cluster.nodes,
            buckets = self.config.buckets.len(),
            vbuckets = self.config.cluster.vbuckets,
            "starting mock cluster"
        );

        self.init_cluster()?;
        self.init_nodes().await?;
        self.init_control().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("mock cluster started");
        Ok(())
    }

    fn init_cluster(&mut self) -> Result<()> {
        let cluster = Arc::new(Cluster::new(self.config.clone()));
        self.cluster = Some(cluster);
        self.health.cluster = ComponentHealth::Healthy;
        Ok(())
    }

    async fn init_nodes(&mut self) -> Result<()> {
        let cluster = self
            .cluster
            .clone()
            .context("cluster must be initialized before nodes")?;
        let host: IpAddr = self
            .config
            .cluster
            .host
            .parse()
            .with_context(|| format!("invalid cluster.host: {}", self.config.cluster.host))?;

        for (bucket_idx, bucket) in cluster.buckets().iter().enumerate() {
            for node in bucket.nodes() {
                let port = cluster.port_for(bucket_idx, node.index());
                let server = Arc::new(NodeServer::new(
                    NodeServerConfig {
                        bind_addr: SocketAddr::new(host, port),
                        advertise_host: self.config.cluster.host.clone(),
                        max_connections: self.config.server.max_connections,
                    },
                    Dispatcher::new(bucket.clone(), node.clone()),
                ));
                if let Err(e) = server.start().await {
                    self.health.nodes = ComponentHealth::Failed;
                    return Err(e).with_context(|| {
                        format!("failed to start node {} of bucket {}", node.index(), bucket.name())
                    });
                }
                self.registry.register(server.clone());
                self.node_servers.push(server);
            }
        }

        self.health.nodes = ComponentHealth::Healthy;
        Ok(())
    }

    async fn init_control(&mut self) -> Result<()> {
        let Some(port) = self.config.cluster.control_port else {
            self.health.control = ComponentHealth::Disabled;
            return Ok(());
        };
        let cluster = self
            .cluster
            .clone()
            .context("cluster must be initialized before the control channel")?;
        let host: IpAddr = self.config.cluster.host.parse()?;

        let listener = Arc::new(ControlListener::new(
            ControlListenerConfig {
                bind_addr: SocketAddr::new(host, port),
                harness_addr: self.options.harness_addr,
            },
            ControlHandler::new(cluster),
        ));
        if let Err(e) = listener.start().await {
            self.health.control = ComponentHealth::Failed;
            return Err(e).context("failed to start control channel");
        }
        self.registry.register(listener.clone());
        self.control = Some(listener);
        self.health.control = ComponentHealth::Healthy;
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c or [`Runtime::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all listeners in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping mock cluster");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        if self.control.is_some() {
            self.health.control = ComponentHealth::Stopping;
        }
        self.health.nodes = ComponentHealth::Stopping;
        self.registry.stop_all().await?;
        if self.control.take().is_some() {
            self.health.control = ComponentHealth::Stopped;
        }
        self.node_servers.clear();
        self.health.nodes = ComponentHealth::Stopped;

        self.cluster = None;
        self.health.cluster = ComponentHealth::Stopped;
        tracing::info!("mock cluster stopped");
        Ok(())
    }

    /// Start every listener on an ephemeral port, control channel included.
    pub async fn start_for_tests(&mut self) -> Result<()> {
        let mut config = (*self.config).clone();
        config.cluster.base_port = 0;
        config.cluster.control_port = Some(0);
        self.config = Arc::new(config);
        self.start().await
    }
}
