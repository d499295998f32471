//! Per-node memcached server.
//!
//! Each node of each bucket listens on its own port. Every accepted
//! connection gets a task that reads, decodes and dispatches one request at
//! a time and flushes the responses through the node's current
//! [`WritePlan`](crate::control::faults::WritePlan).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::commands::Dispatcher;
use super::protocol::MemcachedCodec;
use crate::adapters::tcp::connection::{read_into_buffer, write_planned, ConnectionState, ProtocolConnection};
use crate::adapters::tcp::DecodeResult;
use crate::adapters::{Adapter, AdapterHealth, AdapterState};
use crate::control::routing::NodeAddress;
use crate::core::error::{MockError, MockResult};
use crate::net::tcp::{TcpConnection, TcpListener, TcpListenerConfig};

/// Largest single socket read.
const MAX_READ: usize = 64 * 1024;

/// Listener settings for one node.
#[derive(Debug, Clone)]
pub struct NodeServerConfig {
    /// Bind address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// Host advertised in the cluster map.
    pub advertise_host: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,
}

/// State shared between the server handle and its connection tasks.
struct Shared {
    dispatcher: Dispatcher,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Memcached listener for one node.
pub struct NodeServer {
    config: NodeServerConfig,
    shared: Arc<Shared>,
    state: RwLock<AdapterState>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeServer {
    pub fn new(config: NodeServerConfig, dispatcher: Dispatcher) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                dispatcher,
                total_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                last_error: RwLock::new(None),
            }),
            state: RwLock::new(AdapterState::Created),
            local_addr: RwLock::new(None),
            shutdown_tx,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    async fn bind_and_serve(&self) -> MockResult<()> {
        let listener = Arc::new(TcpListener::new(
            TcpListenerConfig {
                bind_addr: self.config.bind_addr,
                max_connections: self.config.max_connections,
                nodelay: true,
            },
            self.shutdown_tx.subscribe(),
        ));
        let socket = listener.bind().await?;
        let local = socket.local_addr()?;
        *self.local_addr.write() = Some(local);

        let dispatcher = &self.shared.dispatcher;
        dispatcher
            .node()
            .set_address(NodeAddress::new(self.config.advertise_host.clone(), local.port()));
        tracing::info!(
            bucket = %dispatcher.bucket().name(),
            node = dispatcher.node().index(),
            port = local.port(),
            "node listening"
        );

        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match listener.accept(&socket).await {
                    Ok(Some(conn)) => {
                        let shared = shared.clone();
                        let listener = listener.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            handle_connection(shared, conn, shutdown_rx).await;
                            listener.connection_closed();
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        *shared.last_error.write() = Some(e.to_string());
                    }
                }
            }
            listener.stopped();
        });
        Ok(())
    }
}

/// Serve one client until it hangs up, quits, breaks framing or the server
/// shuts down.
async fn handle_connection(shared: Arc<Shared>, conn: TcpConnection, shutdown_rx: watch::Receiver<bool>) {
    let node = shared.dispatcher.node().clone();
    let (id, remote_addr) = (conn.id, conn.remote_addr);
    let mut stream = conn.into_stream();
    let mut connection = ProtocolConnection::new(id, remote_addr, MemcachedCodec::new());

    node.connection_opened();
    tracing::debug!(conn = %id, remote = %remote_addr, node = node.index(), "connection accepted");

    match serve(&shared, &mut stream, &mut connection, shutdown_rx).await {
        Ok(()) => {}
        Err(e) => {
            shared.failed_requests.fetch_add(1, Ordering::Relaxed);
            *shared.last_error.write() = Some(e.to_string());
            tracing::debug!(conn = %id, error = %e, "connection terminated");
        }
    }

    connection.state = ConnectionState::Closed;
    node.connection_closed();
    tracing::debug!(conn = %id, age_ms = connection.age().as_millis() as u64, "connection closed");
}

async fn serve(
    shared: &Shared,
    stream: &mut TcpStream,
    connection: &mut ProtocolConnection<MemcachedCodec>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> MockResult<()> {
    let dispatcher = &shared.dispatcher;
    let mut session = dispatcher.session();

    loop {
        while connection.is_active() {
            let request = match connection.try_decode() {
                DecodeResult::Complete(request) => request,
                DecodeResult::Incomplete => break,
                DecodeResult::Invalid(message) => return Err(MockError::protocol(message)),
            };
            shared.total_requests.fetch_add(1, Ordering::Relaxed);
            connection.stats.command_processed();

            let outcome = dispatcher.dispatch(&mut session, &request)?;
            for response in &outcome.responses {
                connection.encode_response(response)?;
            }
            if outcome.close {
                connection.state = ConnectionState::Closing;
            }
        }

        if !connection.write_buffer.is_empty() {
            let plan = dispatcher.node().faults().write_plan();
            let written = write_planned(stream, &mut connection.write_buffer, plan).await?;
            connection.stats.record_sent(written as u64);
        }
        if !connection.is_active() {
            return Ok(());
        }

        tokio::select! {
            read = read_into_buffer(stream, &mut connection.read_buffer, MAX_READ) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                connection.stats.record_received(n as u64);
            }
            _ = shutdown_rx.changed() => return Ok(()),
        }
    }
}

impl Adapter for NodeServer {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn state(&self) -> AdapterState {
        *self.state.read()
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth {
            state: self.state(),
            active_connections: self.shared.dispatcher.node().connections(),
            total_requests: self.shared.total_requests.load(Ordering::Relaxed),
            failed_requests: self.shared.failed_requests.load(Ordering::Relaxed),
            last_error: self.shared.last_error.read().clone(),
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
                    *self.shared.last_error.write() = Some(e.to_string());
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
    use crate::adapters::memcached::commands::test_support::{bucket_with, dispatcher_for};
    use crate::adapters::memcached::{Opcode, Request, Response};
    use crate::core::config::BucketType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server() -> NodeServer {
        let dispatcher = dispatcher_for(bucket_with(BucketType::Couchbase, ""));
        NodeServer::new(
            NodeServerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                advertise_host: "127.0.0.1".to_string(),
                max_connections: 16,
            },
            dispatcher,
        )
    }

    async fn read_response(stream: &mut TcpStream) -> Response {
        let mut buf = Vec::new();
        loop {
            if let Some((response, _)) = Response::parse(&buf).unwrap() {
                return response;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_start_registers_address() {
        let server = server();
        assert_eq!(server.state(), AdapterState::Created);
        server.start().await.unwrap();
        assert_eq!(server.state(), AdapterState::Running);

        let addr = server.local_addr().unwrap();
        let advertised = server.dispatcher().node().address().unwrap();
        assert_eq!(advertised.port, addr.port());

        server.stop().await.unwrap();
        assert_eq!(server.state(), AdapterState::Stopped);
    }

    #[tokio::test]
    async fn test_serves_requests() {
        let server = server();
        server.start().await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

        let set = Request::new(Opcode::Set)
            .with_key("k")
            .with_extras(vec![0u8; 8])
            .with_value("v")
            .with_opaque(7);
        stream.write_all(&set.encode()).await.unwrap();
        let stored = read_response(&mut stream).await;
        assert!(stored.is_success());
        assert_eq!(stored.opaque, 7);

        stream.write_all(&Request::new(Opcode::Get).with_key("k").encode()).await.unwrap();
        assert_eq!(read_response(&mut stream).await.value, "v");
        assert_eq!(server.health().total_requests, 2);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_magic_closes_connection() {
        let server = server();
        server.start().await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

        let mut frame = Request::new(Opcode::Noop).encode().to_vec();
        frame[0] = 0x42;
        stream.write_all(&frame).await.unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        server.stop().await.unwrap();
    }
}
