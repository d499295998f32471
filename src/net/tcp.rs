//! TCP listener abstraction.
//!
//! Every node of every bucket, and the control channel, accept connections
//! through a [`TcpListener`]. Accepting races the runtime's shutdown watch so
//! listeners stop promptly.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::watch;

use crate::core::error::{MockError, MockResult};

/// TCP listener configuration.
#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    /// Bind address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// TCP nodelay (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            max_connections: 10_000,
            nodelay: true,
        }
    }
}

/// TCP listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpListenerState {
    /// Not yet started.
    Created,
    /// Binding to address.
    Binding,
    /// Accepting connections.
    Listening,
    /// Shutting down.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// TCP connection wrapper with metadata.
pub struct TcpConnection {
    /// Connection ID.
    pub id: ConnectionId,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// Underlying TCP stream.
    stream: TcpStream,
}

impl TcpConnection {
    pub fn new(id: ConnectionId, stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            stream,
        }
    }

    /// Take the underlying stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// TCP listener metrics.
#[derive(Debug, Default)]
pub struct TcpListenerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,

    /// Currently active connections.
    pub connections_active: AtomicU64,

    /// Connections rejected (at capacity).
    pub connections_rejected: AtomicU64,
}

impl TcpListenerMetrics {
    /// Record a new connection.
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed.
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a rejected connection.
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get active connection count.
    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// TCP listener for accepting connections.
pub struct TcpListener {
    config: TcpListenerConfig,
    state: RwLock<TcpListenerState>,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<TcpListenerMetrics>,
}

impl TcpListener {
    pub fn new(config: TcpListenerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            state: RwLock::new(TcpListenerState::Created),
            next_conn_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown_rx,
            metrics: Arc::new(TcpListenerMetrics::default()),
        }
    }

    pub fn config(&self) -> &TcpListenerConfig {
        &self.config
    }

    pub fn state(&self) -> TcpListenerState {
        *self.state.read()
    }

    pub fn metrics(&self) -> &Arc<TcpListenerMetrics> {
        &self.metrics
    }

    /// Check if at connection capacity.
    pub fn at_capacity(&self) -> bool {
        self.metrics.active_connections() >= self.config.max_connections as u64
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind and start listening.
    pub async fn bind(&self) -> MockResult<TokioTcpListener> {
        *self.state.write() = TcpListenerState::Binding;

        let listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| MockError::Io {
                message: format!("failed to bind to {}: {}", self.config.bind_addr, e),
            })?;

        *self.state.write() = TcpListenerState::Listening;

        Ok(listener)
    }

    /// Accept a connection. `None` means the listener is shutting down.
    pub async fn accept(&self, listener: &TokioTcpListener) -> MockResult<Option<TcpConnection>> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(None);
        }

        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if self.at_capacity() {
                            self.metrics.connection_rejected();
                            tracing::warn!(remote = %addr, "connection limit reached, rejecting");
                            return Err(MockError::Io {
                                message: "connection limit reached".to_string(),
                            });
                        }
                        if self.config.nodelay {
                            let _ = stream.set_nodelay(true);
                        }

                        let id = self.next_connection_id();
                        self.metrics.connection_accepted();

                        Ok(Some(TcpConnection::new(id, stream, addr)))
                    }
                    Err(e) => Err(MockError::Io {
                        message: format!("accept failed: {}", e),
                    }),
                }
            }
            _ = shutdown_rx.changed() => {
                Ok(None)
            }
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        *self.state.write() = TcpListenerState::ShuttingDown;
    }

    /// Mark as stopped.
    pub fn stopped(&self) {
        *self.state.write() = TcpListenerState::Stopped;
    }

    /// Record connection closed.
    pub fn connection_closed(&self) {
        self.metrics.connection_closed();
    }
}
