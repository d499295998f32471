//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use cbmock::adapters::memcached::{Opcode, Request, Response};
use cbmock::cluster::{Bucket, Cluster};
use cbmock::core::config::Config;
use cbmock::runtime::Runtime;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Write a config file with the given TOML content.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Three nodes, one replica, sixteen vbuckets.
pub fn small_config() -> Config {
    let mut config = Config::default();
    config.cluster.nodes = 3;
    config.cluster.replicas = 1;
    config.cluster.vbuckets = 16;
    config
}

/// Start a runtime on ephemeral ports with the control channel enabled.
pub async fn start(config: Config) -> Runtime {
    let mut runtime = Runtime::new(config).expect("valid config");
    runtime.start_for_tests().await.expect("runtime starts");
    runtime
}

pub fn cluster(runtime: &Runtime) -> &Arc<Cluster> {
    runtime.cluster().expect("cluster initialized")
}

pub fn bucket(runtime: &Runtime) -> Arc<Bucket> {
    cluster(runtime).bucket(None).expect("default bucket")
}

/// Index of the node owning `key` in the default bucket.
pub fn owner_of(runtime: &Runtime, key: &str) -> usize {
    let bucket = bucket(runtime);
    let vb = bucket.vbucket_for_key(key.as_bytes());
    bucket.map().get(vb).and_then(|info| info.owner).expect("owned vbucket")
}

/// Index of the first replica of `key` in the default bucket.
pub fn replica_of(runtime: &Runtime, key: &str) -> usize {
    let bucket = bucket(runtime);
    let vb = bucket.vbucket_for_key(key.as_bytes());
    bucket.map().get(vb).and_then(|info| info.replicas.first().copied()).expect("replica")
}

// ============================================================================
// Binary protocol client
// ============================================================================

/// Minimal binary protocol client.
pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
    vbuckets: usize,
}

impl Client {
    pub async fn connect(runtime: &Runtime, node: usize) -> Self {
        Self::connect_to(bucket(runtime), node).await
    }

    pub async fn connect_bucket(runtime: &Runtime, name: &str, node: usize) -> Self {
        let bucket = cluster(runtime).bucket(Some(name)).expect("bucket exists");
        Self::connect_to(bucket, node).await
    }

    async fn connect_to(bucket: Arc<Bucket>, node: usize) -> Self {
        let port = bucket.ports()[node];
        let stream = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .expect("connect to node");
        Self {
            stream,
            buf: BytesMut::new(),
            vbuckets: bucket.map().len(),
        }
    }

    /// Connect to the node owning `key`.
    pub async fn for_key(runtime: &Runtime, key: &str) -> Self {
        Self::connect(runtime, owner_of(runtime, key)).await
    }

    fn vbucket(&self, key: &[u8]) -> u16 {
        cbmock::routing::vbucket_for_key(key, self.vbuckets)
    }

    /// Stamp the vbucket for the request key.
    pub fn route(&self, request: Request) -> Request {
        let vb = self.vbucket(&request.key);
        request.with_vbucket(vb)
    }

    pub async fn write(&mut self, request: &Request) {
        self.stream
            .write_all(&request.encode())
            .await
            .expect("write request");
    }

    /// Read the next response; `None` when the server closed the connection.
    pub async fn read(&mut self) -> Option<Response> {
        loop {
            if let Some((response, used)) = Response::parse(&self.buf).expect("valid response") {
                let _ = self.buf.split_to(used);
                return Some(response);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.expect("read response");
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send with the vbucket stamped and read one response.
    pub async fn call(&mut self, request: Request) -> Response {
        let request = self.route(request);
        self.write(&request).await;
        self.read().await.expect("response")
    }

    /// Raw bytes available within `millis`.
    pub async fn read_raw(&mut self, millis: u64) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf).to_vec();
        let mut chunk = [0u8; 4096];
        while let Ok(Ok(n)) = tokio::time::timeout(
            std::time::Duration::from_millis(millis),
            self.stream.read(&mut chunk),
        )
        .await
        {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Response {
        self.call(set(key, value)).await
    }

    pub async fn get(&mut self, key: &str) -> Response {
        self.call(Request::new(Opcode::Get).with_key(key.to_string()))
            .await
    }
}

pub fn set(key: &str, value: &str) -> Request {
    Request::new(Opcode::Set)
        .with_key(key.to_string())
        .with_extras(vec![0u8; 8])
        .with_value(value.to_string())
}

/// Subdoc single-path request with no flags.
pub fn subdoc(opcode: Opcode, key: &str, path: &str, value: &str) -> Request {
    let mut extras = (path.len() as u16).to_be_bytes().to_vec();
    extras.push(0);
    Request::new(opcode)
        .with_key(key.to_string())
        .with_extras(extras)
        .with_value(format!("{}{}", path, value))
}

// ============================================================================
// Control channel client
// ============================================================================

pub struct ControlClient {
    reader: BufReader<TcpStream>,
}

impl ControlClient {
    pub async fn connect(runtime: &Runtime) -> Self {
        let addr = runtime.control_addr().expect("control channel enabled");
        let stream = TcpStream::connect(addr).await.expect("connect to control");
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send one command and return the whole response object.
    pub async fn send(&mut self, command: &str, payload: Value) -> Value {
        let line = serde_json::json!({"command": command, "payload": payload}).to_string();
        self.reader
            .get_mut()
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("write control line");
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.expect("read control line");
        serde_json::from_str(&reply).expect("control reply is JSON")
    }

    /// Send and assert success, returning the payload.
    pub async fn ok(&mut self, command: &str, payload: Value) -> Value {
        let reply = self.send(command, payload).await;
        assert_eq!(reply["status"], "ok", "{} failed: {}", command, reply);
        reply.get("payload").cloned().unwrap_or(Value::Null)
    }
}
