//! Cluster, buckets and nodes.
//!
//! ```text
//!   Cluster
//!     ├── clock (shared, time-travel aware)
//!     └── Bucket "default"
//!           ├── VBucketMap (owner + replicas + uuid per vbucket)
//!           ├── Node 0 ── Storage, FaultState, NodeSettings
//!           ├── Node 1 ── ...
//!           └── Node N
//! ```
//!
//! Every bucket runs its own set of nodes, each listening on its own port.
//! Topology changes (failover, respawn, coordinate regeneration) rebalance
//! the bucket's map and push the new vbucket uuids into every node's store.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rand::Rng;

use crate::control::faults::FaultState;
use crate::control::placement::VBucketMap;
use crate::control::routing::{self, ClusterMap, NodeAddress};
use crate::core::config::{BucketConfig, BucketType, ClusterConfig, CompressionMode, Config, ServerConfig};
use crate::core::error::{MockError, MockResult};
use crate::core::time::{Clock, SystemClock};
use crate::storage::{PeerTable, Storage};

/// Reported by VERSION, stats and the cluster map.
pub const SERVER_VERSION: &str = "9.9.9";

/// Runtime-adjustable protocol behavior of one node.
#[derive(Debug)]
pub struct NodeSettings {
    cccp: AtomicBool,
    enhanced_errors: AtomicBool,
    compression: RwLock<CompressionMode>,
    max_value_size: usize,
}

impl NodeSettings {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            cccp: AtomicBool::new(server.cccp),
            enhanced_errors: AtomicBool::new(server.enhanced_errors),
            compression: RwLock::new(server.compression),
            max_value_size: server.max_value_size,
        }
    }

    pub fn cccp(&self) -> bool {
        self.cccp.load(Ordering::Acquire)
    }

    pub fn set_cccp(&self, enabled: bool) {
        self.cccp.store(enabled, Ordering::Release);
    }

    pub fn enhanced_errors(&self) -> bool {
        self.enhanced_errors.load(Ordering::Acquire)
    }

    pub fn set_enhanced_errors(&self, enabled: bool) {
        self.enhanced_errors.store(enabled, Ordering::Release);
    }

    pub fn compression(&self) -> CompressionMode {
        *self.compression.read()
    }

    pub fn set_compression(&self, mode: CompressionMode) {
        *self.compression.write() = mode;
    }

    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}

/// One server of a bucket.
pub struct Node {
    index: usize,
    storage: Arc<Storage>,
    faults: FaultState,
    settings: NodeSettings,
    active: AtomicBool,
    address: RwLock<Option<NodeAddress>>,
    started_at: Instant,
    connections: AtomicUsize,
    total_connections: AtomicU64,
    commands: AtomicU64,
}

impl Node {
    fn new(index: usize, storage: Arc<Storage>, server: &ServerConfig) -> Self {
        Self {
            index,
            storage,
            faults: FaultState::new(),
            settings: NodeSettings::from_config(server),
            active: AtomicBool::new(true),
            address: RwLock::new(None),
            started_at: Instant::now(),
            connections: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn faults(&self) -> &FaultState {
        &self.faults
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn address(&self) -> Option<NodeAddress> {
        self.address.read().clone()
    }

    /// Record where the node's listener ended up.
    pub fn set_address(&self, address: NodeAddress) {
        *self.address.write() = Some(address);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn command_processed(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }
}

/// A bucket and the nodes serving it.
pub struct Bucket {
    config: BucketConfig,
    uuid: String,
    map: Arc<VBucketMap>,
    nodes: Vec<Arc<Node>>,
    rev: AtomicU64,
}

impl Bucket {
    pub fn new(
        config: BucketConfig,
        cluster: &ClusterConfig,
        server: &ServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let replicas = match config.bucket_type {
            BucketType::Couchbase => cluster.replicas,
            BucketType::Memcached => 0,
        };
        let map = Arc::new(VBucketMap::new(cluster.vbuckets.max(1), replicas));
        let peers = Arc::new(PeerTable::new());
        let nodes = (0..cluster.nodes)
            .map(|idx| {
                let storage = Storage::new(
                    idx,
                    config.bucket_type,
                    map.clone(),
                    peers.clone(),
                    clock.clone(),
                );
                Arc::new(Node::new(idx, storage, server))
            })
            .collect();

        let bucket = Arc::new(Self {
            config,
            uuid: generate_bucket_uuid(),
            map,
            nodes,
            rev: AtomicU64::new(0),
        });
        bucket.rebalance();
        tracing::info!(
            bucket = %bucket.name(),
            kind = %bucket.bucket_type(),
            uuid = %bucket.uuid(),
            nodes = bucket.nodes.len(),
            vbuckets = bucket.map.len(),
            "bucket created"
        );
        bucket
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn password(&self) -> &str {
        &self.config.password
    }

    pub fn bucket_type(&self) -> BucketType {
        self.config.bucket_type
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn map(&self) -> &Arc<VBucketMap> {
        &self.map
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> MockResult<&Arc<Node>> {
        self.nodes
            .get(idx)
            .ok_or_else(|| MockError::control(format!("no such server: {}", idx)))
    }

    pub fn rev(&self) -> u64 {
        self.rev.load(Ordering::Acquire)
    }

    /// Indices of nodes currently up.
    pub fn active_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.is_active())
            .map(|n| n.index())
            .collect()
    }

    /// VBucket serving `key`. Memcached buckets have a single keyspace.
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        match self.config.bucket_type {
            BucketType::Couchbase => routing::vbucket_for_key(key, self.map.len()),
            BucketType::Memcached => 0,
        }
    }

    /// Reassign vbuckets across active nodes with fresh uuids.
    pub fn rebalance(&self) {
        let active = self.active_nodes();
        let uuids = self.map.rebalance(&active);
        self.install_uuids(&uuids);
    }

    /// Give every vbucket a new uuid without moving ownership.
    pub fn regen_coords(&self) {
        let uuids = self.map.regenerate_uuids();
        self.install_uuids(&uuids);
        tracing::info!(bucket = %self.name(), "vbucket coordinates regenerated");
    }

    fn install_uuids(&self, uuids: &[u64]) {
        for node in &self.nodes {
            node.storage().update_coords(uuids);
        }
        self.rev.fetch_add(1, Ordering::AcqRel);
    }

    /// Take a node out of the cluster.
    pub fn failover(&self, idx: usize) -> MockResult<()> {
        self.node(idx)?.set_active(false);
        self.rebalance();
        tracing::info!(bucket = %self.name(), node = idx, "node failed over");
        Ok(())
    }

    /// Bring a failed node back.
    pub fn respawn(&self, idx: usize) -> MockResult<()> {
        self.node(idx)?.set_active(true);
        self.rebalance();
        tracing::info!(bucket = %self.name(), node = idx, "node respawned");
        Ok(())
    }

    /// Topology snapshot for clients.
    pub fn cluster_map(&self) -> ClusterMap {
        ClusterMap {
            bucket: self.config.name.clone(),
            bucket_uuid: self.uuid.clone(),
            bucket_type: self.config.bucket_type,
            rev: self.rev(),
            num_replicas: self.map.num_replicas(),
            nodes: self
                .nodes
                .iter()
                .map(|n| n.address().unwrap_or_else(|| NodeAddress::new("", 0)))
                .collect(),
            active: self.active_nodes(),
            vbuckets: self.map.snapshot(),
        }
    }

    /// Cluster map as served by node `idx`.
    pub fn config_for(&self, idx: usize) -> String {
        let host = self
            .nodes
            .get(idx)
            .and_then(|n| n.address())
            .map(|a| a.host)
            .unwrap_or_default();
        self.cluster_map().render_for(&host)
    }

    /// Listener ports of every node, in node order.
    pub fn ports(&self) -> Vec<u16> {
        self.nodes
            .iter()
            .map(|n| n.address().map(|a| a.port).unwrap_or(0))
            .collect()
    }
}

fn generate_bucket_uuid() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("{:032x}", value)
}

/// Every bucket of the mock.
pub struct Cluster {
    config: Arc<Config>,
    clock: Arc<SystemClock>,
    buckets: Vec<Arc<Bucket>>,
}

impl Cluster {
    pub fn new(config: Arc<Config>) -> Self {
        let clock = Arc::new(SystemClock::new());
        let buckets = config
            .buckets
            .iter()
            .map(|b| {
                Bucket::new(
                    b.clone(),
                    &config.cluster,
                    &config.server,
                    clock.clone() as Arc<dyn Clock>,
                )
            })
            .collect();
        Self {
            config,
            clock,
            buckets,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<SystemClock> {
        &self.clock
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    /// Look up a bucket by name, defaulting to `default` (or the first bucket).
    pub fn bucket(&self, name: Option<&str>) -> MockResult<Arc<Bucket>> {
        let found = match name {
            Some(name) => self.buckets.iter().find(|b| b.name() == name),
            None => self
                .buckets
                .iter()
                .find(|b| b.name() == "default")
                .or_else(|| self.buckets.first()),
        };
        found.cloned().ok_or_else(|| {
            MockError::control(format!("no such bucket: {}", name.unwrap_or("default")))
        })
    }

    /// Listen port for a node, given its position across all buckets.
    pub fn port_for(&self, bucket_idx: usize, node_idx: usize) -> u16 {
        let base = self.config.cluster.base_port;
        if base == 0 {
            return 0;
        }
        let offset = bucket_idx * self.config.cluster.nodes + node_idx;
        base.saturating_add(offset as u16)
    }

    pub fn time_travel(&self, secs: i64) {
        self.clock.time_travel(secs);
        tracing::info!(secs, "cluster clock shifted");
    }
}
