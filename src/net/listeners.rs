//! Control channel listener.
//!
//! Accepts harness connections and answers one JSON line per request line.
//! A client may also be handed the channel in the other direction: when
//! started with a harness address, the mock dials out and serves the same
//! protocol over that connection.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::tcp::{TcpListener, TcpListenerConfig};
use crate::adapters::{Adapter, AdapterHealth, AdapterState};
use crate::control::api::ControlHandler;
use crate::core::error::MockResult;

/// Control listener configuration.
#[derive(Debug, Clone)]
pub struct ControlListenerConfig {
    /// Bind address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// Harness to dial once started, if any.
    pub harness_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    requests: AtomicU64,
    failed: AtomicU64,
}

/// Line-delimited JSON control server.
pub struct ControlListener {
    config: ControlListenerConfig,
    handler: ControlHandler,
    counters: Arc<Counters>,
    state: RwLock<AdapterState>,
    local_addr: RwLock<Option<SocketAddr>>,
    last_error: Arc<RwLock<Option<String>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlListener {
    pub fn new(config: ControlListenerConfig, handler: ControlHandler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handler,
            counters: Arc::new(Counters::default()),
            state: RwLock::new(AdapterState::Created),
            local_addr: RwLock::new(None),
            last_error: Arc::new(RwLock::new(None)),
            shutdown_tx,
        }
    }

    pub fn handler(&self) -> &ControlHandler {
        &self.handler
    }

    async fn bind_and_serve(&self) -> MockResult<()> {
        let listener = Arc::new(TcpListener::new(
            TcpListenerConfig {
                bind_addr: self.config.bind_addr,
                max_connections: 64,
                nodelay: true,
            },
            self.shutdown_tx.subscribe(),
        ));
        let socket = listener.bind().await?;
        let local = socket.local_addr()?;
        *self.local_addr.write() = Some(local);
        tracing::info!(addr = %local, "control channel listening");

        let handler = self.handler.clone();
        let counters = self.counters.clone();
        let last_error = self.last_error.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match listener.accept(&socket).await {
                    Ok(Some(conn)) => {
                        let (handler, counters) = (handler.clone(), counters.clone());
                        let listener = listener.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tracing::debug!(conn = %conn.id, remote = %conn.remote_addr, "control client connected");
                        tokio::spawn(async move {
                            if let Err(e) = serve_lines(&handler, &counters, conn.into_stream(), shutdown_rx).await {
                                tracing::debug!(error = %e, "control connection ended");
                            }
                            listener.connection_closed();
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "control accept failed");
                        *last_error.write() = Some(e.to_string());
                    }
                }
            }
            listener.stopped();
        });

        if let Some(harness) = self.config.harness_addr {
            let stream = TcpStream::connect(harness).await?;
            tracing::info!(harness = %harness, "connected to harness");
            let (handler, counters) = (self.handler.clone(), self.counters.clone());
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = serve_lines(&handler, &counters, stream, shutdown_rx).await {
                    tracing::warn!(error = %e, "harness connection ended");
                }
            });
        }
        Ok(())
    }
}

/// Answer request lines until EOF or shutdown.
async fn serve_lines<S>(
    handler: &ControlHandler,
    counters: &Counters,
    stream: S,
    shutdown_rx: watch::Receiver<bool>,
) -> MockResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    counters.connections.fetch_add(1, Ordering::Relaxed);
    let result = answer_lines(handler, counters, stream, shutdown_rx).await;
    counters.connections.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn answer_lines<S>(
    handler: &ControlHandler,
    counters: &Counters,
    stream: S,
    mut shutdown_rx: watch::Receiver<bool>,
) -> MockResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown_rx.changed() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        counters.requests.fetch_add(1, Ordering::Relaxed);
        let mut reply = handler.handle_line(&line);
        if reply.starts_with(r#"{"status":"fail""#) {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }
}

impl Adapter for ControlListener {
    fn name(&self) -> &'static str {
        "control"
    }

    fn state(&self) -> AdapterState {
        *self.state.read()
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth {
            state: self.state(),
            active_connections: self.counters.connections.load(Ordering::Relaxed) as usize,
            total_requests: self.counters.requests.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = MockResult<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write() = AdapterState::Starting;
            match self.bind_and_serve().await {
                Ok(()) => {
                    *self.state.write() = AdapterState::Running;
                    Ok(())
                }
                Err(e) => {
                    *self.state.write() = AdapterState::Failed;
                    *self.last_error.write() = Some(e.to_string());
                    Err(e)
                }
            }
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = MockResult<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write() = AdapterState::ShuttingDown;
            let _ = self.shutdown_tx.send(true);
            *self.state.write() = AdapterState::Stopped;
            Ok(())
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::cluster::Cluster;
    use crate::core::config::Config;
    use serde_json::Value;

    fn listener(harness_addr: Option<SocketAddr>) -> ControlListener {
        let cluster = Arc::new(Cluster::new(Arc::new(Config::default())));
        ControlListener::new(
            ControlListenerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                harness_addr,
            },
            ControlHandler::new(cluster),
        )
    }

    async fn roundtrip<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut BufReader<S>, line: &str) -> Value {
        stream.get_mut().write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_accepts_commands() {
        let listener = listener(None);
        listener.start().await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let mut stream = BufReader::new(stream);

        let reply = roundtrip(&mut stream, r#"{"command":"HELP"}"#).await;
        assert_eq!(reply["status"], "ok");
        let reply = roundtrip(&mut stream, r#"{"command":"FAILOVER","payload":{"idx":1}}"#).await;
        assert_eq!(reply["status"], "ok");
        let reply = roundtrip(&mut stream, "garbage").await;
        assert_eq!(reply["status"], "fail");

        let bucket = listener.handler().cluster().bucket(None).unwrap();
        assert!(!bucket.nodes()[1].is_active());
        let health = listener.health();
        assert_eq!(health.total_requests, 3);
        assert_eq!(health.failed_requests, 1);
        assert_eq!(health.active_connections, 1);
        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dials_harness() {
        let harness = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = listener(Some(harness.local_addr().unwrap()));
        listener.start().await.unwrap();

        let (stream, _) = harness.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let reply = roundtrip(&mut stream, r#"{"command":"GET_MCPORTS"}"#).await;
        assert_eq!(reply["status"], "ok");
        listener.stop().await.unwrap();
    }
}
