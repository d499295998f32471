//! Protocol adapters.
//!
//! Every listener the mock opens implements [`Adapter`], which gives the
//! runtime one lifecycle for the per-node memcached servers and the control
//! channel:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        AdapterRegistry                          │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │  NodeServer (bucket, node)   │  ControlListener                 │
//! │                              │                                  │
//! │  - memcached binary          │  - line-delimited JSON           │
//! │  - one task per connection   │  - fault injection, topology     │
//! │  - WritePlan on every flush  │  - persistence and cache pokes   │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! - [`memcached`] - Couchbase flavored memcached binary protocol
//! - [`tcp`] - codec trait, read buffer and connection helpers

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use crate::core::error::MockResult;

pub mod memcached;
pub mod tcp;

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Adapter is created but not started.
    Created,
    /// Adapter is binding its listener.
    Starting,
    /// Adapter is running and accepting connections.
    Running,
    /// Adapter is shutting down.
    ShuttingDown,
    /// Adapter has stopped.
    Stopped,
    /// Adapter failed to start.
    Failed,
}

/// Adapter health status.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    /// Current state.
    pub state: AdapterState,

    /// Number of open connections.
    pub active_connections: usize,

    /// Total requests processed.
    pub total_requests: u64,

    /// Requests that ended a connection with an error.
    pub failed_requests: u64,

    /// Last error message (if any).
    pub last_error: Option<String>,
}

/// Common lifecycle of every listener.
pub trait Adapter: Send + Sync {
    /// Short name used in logs ("memcached", "control").
    fn name(&self) -> &'static str;

    fn state(&self) -> AdapterState;

    fn health(&self) -> AdapterHealth;

    /// Bind the listener and begin accepting connections. Completes once
    /// the listener is bound.
    fn start(&self) -> Pin<Box<dyn Future<Output = MockResult<()>> + Send + '_>>;

    /// Stop accepting connections and close the open ones.
    fn stop(&self) -> Pin<Box<dyn Future<Output = MockResult<()>> + Send + '_>>;

    /// Address the listener is bound to, once started.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Handle to a running adapter for management operations.
pub struct AdapterHandle {
    adapter: Arc<dyn Adapter>,
}

impl AdapterHandle {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter }
    }

    pub fn name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn state(&self) -> AdapterState {
        self.adapter.state()
    }

    pub fn health(&self) -> AdapterHealth {
        self.adapter.health()
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }
}

/// Adapters in start order.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<AdapterHandle>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.push(AdapterHandle::new(adapter));
    }

    pub fn adapters(&self) -> &[AdapterHandle] {
        &self.adapters
    }

    /// Start every adapter in registration order.
    pub async fn start_all(&self) -> MockResult<()> {
        for handle in &self.adapters {
            handle.adapter.start().await?;
        }
        Ok(())
    }

    /// Stop every adapter in reverse registration order.
    pub async fn stop_all(&self) -> MockResult<()> {
        for handle in self.adapters.iter().rev() {
            handle.adapter.stop().await?;
        }
        Ok(())
    }
}
