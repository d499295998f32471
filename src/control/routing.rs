//! Key routing and cluster maps.
//!
//! Keys are routed to vbuckets with the CRC scheme clients implement:
//! `vbucket = ((crc32(key) >> 16) & 0x7fff) % num_vbuckets`
//!
//! The cluster map is the bucket configuration JSON returned by
//! GET_CLUSTER_CONFIG and attached to NOT_MY_VBUCKET responses. The serving
//! node's hostname is replaced by the literal `$HOST`, so clients substitute
//! the address they actually connected to.

use serde_json::{json, Value};

use crate::control::placement::VBucketInfo;
use crate::core::config::BucketType;

/// Placeholder clients replace with the address they used.
pub const HOST_PLACEHOLDER: &str = "$HOST";

/// IEEE CRC-32.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// VBucket a key belongs to.
pub fn vbucket_for_key(key: &[u8], num_vbuckets: usize) -> u16 {
    if num_vbuckets == 0 {
        return 0;
    }
    let digest = (crc32(key) >> 16) & 0x7fff;
    (digest as usize % num_vbuckets) as u16
}

/// Address a node listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`
    pub fn socket_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Snapshot of a bucket's topology, ready to serialize.
#[derive(Debug, Clone)]
pub struct ClusterMap {
    pub bucket: String,
    pub bucket_uuid: String,
    pub bucket_type: BucketType,
    pub rev: u64,
    pub num_replicas: usize,
    /// Every node, indexed by node number.
    pub nodes: Vec<NodeAddress>,
    /// Node numbers that are up, in order.
    pub active: Vec<usize>,
    pub vbuckets: Vec<VBucketInfo>,
}

impl ClusterMap {
    /// Bucket configuration document.
    pub fn to_json(&self) -> Value {
        let active: Vec<&NodeAddress> =
            self.active.iter().filter_map(|n| self.nodes.get(*n)).collect();
        let nodes: Vec<Value> = active
            .iter()
            .map(|a| {
                json!({
                    "hostname": a.socket_name(),
                    "clusterMembership": "active",
                    "status": "healthy",
                    "version": "9.9.9",
                    "ports": { "direct": a.port, "proxy": 0 },
                })
            })
            .collect();
        let nodes_ext: Vec<Value> = active
            .iter()
            .map(|a| json!({ "hostname": a.host, "services": { "kv": a.port } }))
            .collect();
        let base = format!("/pools/default/buckets/{}", self.bucket);

        let mut doc = json!({
            "rev": self.rev,
            "name": self.bucket,
            "uuid": self.bucket_uuid,
            "bucketType": match self.bucket_type {
                BucketType::Couchbase => "membase",
                BucketType::Memcached => "memcached",
            },
            "authType": "sasl",
            "proxyPort": 0,
            "uri": base,
            "streamingUri": format!("/pools/default/bucketsStreaming/{}", self.bucket),
            "flushCacheUri": format!("{}/controller/doFlush", base),
            "stats": { "uri": format!("{}/stats", base) },
            "nodes": nodes,
            "nodesExt": nodes_ext,
        });

        match self.bucket_type {
            BucketType::Couchbase => {
                doc["nodeLocator"] = json!("vbucket");
                doc["bucketCapabilities"] = json!(["cccp", "xattr", "touch", "dcp", "couchapi"]);
                doc["vBucketServerMap"] = self.server_map(&active);
            }
            BucketType::Memcached => {
                doc["nodeLocator"] = json!("ketama");
                doc["bucketCapabilities"] = json!([]);
            }
        }
        doc
    }

    fn server_map(&self, active: &[&NodeAddress]) -> Value {
        let position = |node: usize| -> i64 {
            self.active
                .iter()
                .position(|a| *a == node)
                .map(|p| p as i64)
                .unwrap_or(-1)
        };
        let map: Vec<Vec<i64>> = self
            .vbuckets
            .iter()
            .map(|vb| {
                let mut row = Vec::with_capacity(self.num_replicas + 1);
                row.push(vb.owner.map(position).unwrap_or(-1));
                for r in 0..self.num_replicas {
                    row.push(vb.replicas.get(r).map(|n| position(*n)).unwrap_or(-1));
                }
                row
            })
            .collect();
        json!({
            "hashAlgorithm": "CRC",
            "numReplicas": self.num_replicas,
            "serverList": active.iter().map(|a| a.socket_name()).collect::<Vec<_>>(),
            "vBucketMap": map,
        })
    }

    /// Configuration text as served by the node on `host`.
    pub fn render_for(&self, host: &str) -> String {
        let text = self.to_json().to_string();
        if host.is_empty() {
            return text;
        }
        text.replace(host, HOST_PLACEHOLDER)
    }
}
