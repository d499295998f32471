//! Control channel API.
//!
//! The control channel carries one JSON object per line:
//!
//! ```text
//!   → {"command": "FAILOVER", "payload": {"idx": 1}}
//!   ← {"status": "ok"}
//!   → {"command": "KEYINFO", "payload": {"Key": "foo"}}
//!   ← {"status": "ok", "payload": [{"Conf": {...}, "Cache": {...}, "Disk": {}}, null]}
//!   → {"command": "NOPE"}
//!   ← {"status": "fail", "error": "unknown command: NOPE"}
//! ```
//!
//! Every command takes effect before the response is written, so the next
//! protocol command a node processes already sees it.
//!
//! Key payloads use the capitalized field names (`Key`, `Bucket`,
//! `OnMaster`, `OnReplicas`, `CAS`, `Value`) existing test harnesses send.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::control::cluster::{Bucket, Cluster};
use crate::core::config::CompressionMode;
use crate::core::error::{ErrorCode, MockError, MockResult};
use crate::storage::{Item, KeySpec, Storage};

/// Every command the channel understands, as listed by `HELP`.
pub const COMMANDS: &[&str] = &[
    "FAILOVER",
    "RESPAWN",
    "REGEN_VBCOORDS",
    "HICCUP",
    "TRUNCATE",
    "OPFAIL",
    "SET_CCCP",
    "SET_ENHANCED_ERRORS",
    "SET_COMPRESSION",
    "PERSIST",
    "CACHE",
    "ENDURE",
    "UNPERSIST",
    "UNCACHE",
    "PURGE",
    "KEYINFO",
    "TIME_TRAVEL",
    "MOCKINFO",
    "HELP",
    "GET_MCPORTS",
    "START_CMDLOG",
    "STOP_CMDLOG",
    "GET_CMDLOG",
    "SET_PERSIST",
    "SET_REPLICATE",
];

// ============================================================================
// Envelope
// ============================================================================

/// One control request line.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    /// Command name, matched case-insensitively.
    pub command: String,

    #[serde(default)]
    pub payload: Value,
}

/// One control response line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ControlResponse {
    Ok {
        #[serde(skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    Fail {
        error: String,
    },
}

impl ControlResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Payload naming a node of a bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct NodePayload {
    pub idx: usize,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketPayload {
    #[serde(default)]
    pub bucket: Option<String>,
}

/// Stall writes after `offset` bytes for `msecs`. Zero `msecs` clears it.
#[derive(Debug, Clone, Deserialize)]
pub struct HiccupPayload {
    pub msecs: i64,
    #[serde(default)]
    pub offset: i64,
    /// Only this node index; every node when absent.
    #[serde(default)]
    pub idx: Option<usize>,
    #[serde(default)]
    pub bucket: Option<String>,
}

/// Cut every write at `limit` bytes. Zero clears it.
#[derive(Debug, Clone, Deserialize)]
pub struct TruncatePayload {
    pub limit: i64,
    #[serde(default)]
    pub idx: Option<usize>,
    #[serde(default)]
    pub bucket: Option<String>,
}

/// Force `code` on the next `count` commands (negative: forever).
#[derive(Debug, Clone, Deserialize)]
pub struct OpFailPayload {
    pub code: u16,
    pub count: i32,
    /// Node indexes to arm; every node when absent or empty.
    #[serde(default)]
    pub servers: Vec<usize>,
    /// Only fail this opcode.
    #[serde(default)]
    pub opcode: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnabledPayload {
    pub enabled: bool,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionPayload {
    pub mode: CompressionMode,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeTravelPayload {
    #[serde(rename = "Offset")]
    pub offset: i64,
}

/// Which replicas a key command touches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ReplicaSelector {
    /// The first `n` active replicas.
    Count(usize),
    /// Replicas by position in the vbucket's replica list.
    Indexes(Vec<usize>),
}

impl Default for ReplicaSelector {
    fn default() -> Self {
        Self::Count(0)
    }
}

/// Payload of the cache and persistence commands.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyPayload {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "Bucket", default)]
    pub bucket: Option<String>,

    #[serde(rename = "OnMaster", default)]
    pub on_master: bool,

    #[serde(rename = "OnReplicas", default)]
    pub on_replicas: ReplicaSelector,

    /// Zero keeps the source CAS; negative derives a fresh one from it.
    #[serde(rename = "CAS", default)]
    pub cas: i64,

    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

/// Direct cache or disk manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Persist,
    Cache,
    Endure,
    Unpersist,
    Uncache,
    Purge,
}

impl KeyAction {
    fn from_command(name: &str) -> Option<Self> {
        Some(match name {
            "PERSIST" => Self::Persist,
            "CACHE" => Self::Cache,
            "ENDURE" => Self::Endure,
            "UNPERSIST" => Self::Unpersist,
            "UNCACHE" => Self::Uncache,
            "PURGE" => Self::Purge,
            _ => return None,
        })
    }

    fn apply(self, storage: &Storage, item: &Item) {
        let ks = &item.key_spec;
        match self {
            Self::Persist => storage.put_persisted(item.clone()),
            Self::Cache => storage.put_cached(item.clone()),
            Self::Endure => {
                storage.put_persisted(item.clone());
                storage.put_cached(item.clone());
            }
            Self::Unpersist => storage.remove_persisted(ks),
            Self::Uncache => storage.remove_cached(ks),
            Self::Purge => {
                storage.remove_persisted(ks);
                storage.remove_cached(ks);
            }
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(payload: Value) -> MockResult<T> {
    // commands without required fields may arrive with no payload at all
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload).map_err(|e| MockError::control(format!("bad payload: {}", e)))
}

// ============================================================================
// Handler
// ============================================================================

/// Executes control commands against a cluster.
#[derive(Clone)]
pub struct ControlHandler {
    cluster: Arc<Cluster>,
}

impl ControlHandler {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Handle one request line and render the response line.
    pub fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => self.handle(request),
            Err(e) => ControlResponse::Fail {
                error: format!("malformed request: {}", e),
            },
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"status":"fail","error":"unserializable response"}"#.to_string())
    }

    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        let command = request.command.to_ascii_uppercase();
        match self.execute(&command, request.payload) {
            Ok(payload) => {
                tracing::info!(command = %command, "control command applied");
                ControlResponse::Ok { payload }
            }
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "control command failed");
                ControlResponse::Fail { error: e.to_string() }
            }
        }
    }

    /// Run `command`, returning the response payload (`null` for none).
    pub fn execute(&self, command: &str, payload: Value) -> MockResult<Value> {
        if let Some(action) = KeyAction::from_command(command) {
            return self.key_action(action, parse(payload)?);
        }

        match command {
            "FAILOVER" => {
                let p: NodePayload = parse(payload)?;
                self.cluster.bucket(p.bucket.as_deref())?.failover(p.idx)?;
                Ok(Value::Null)
            }
            "RESPAWN" => {
                let p: NodePayload = parse(payload)?;
                self.cluster.bucket(p.bucket.as_deref())?.respawn(p.idx)?;
                Ok(Value::Null)
            }
            "REGEN_VBCOORDS" => {
                let p: BucketPayload = parse(payload)?;
                self.cluster.bucket(p.bucket.as_deref())?.regen_coords();
                Ok(Value::Null)
            }
            "HICCUP" => {
                let p: HiccupPayload = parse(payload)?;
                for bucket in self.buckets(p.bucket.as_deref())? {
                    for node in select_nodes(&bucket, p.idx)? {
                        bucket.node(node)?.faults().set_hiccup(p.msecs, p.offset)?;
                    }
                }
                Ok(Value::Null)
            }
            "TRUNCATE" => {
                let p: TruncatePayload = parse(payload)?;
                for bucket in self.buckets(p.bucket.as_deref())? {
                    for node in select_nodes(&bucket, p.idx)? {
                        bucket.node(node)?.faults().set_truncate(p.limit)?;
                    }
                }
                Ok(Value::Null)
            }
            "OPFAIL" => {
                let p: OpFailPayload = parse(payload)?;
                let code = ErrorCode::try_from(p.code)
                    .map_err(|_| MockError::control(format!("invalid error code: 0x{:04x}", p.code)))?;
                for bucket in self.cluster.buckets() {
                    for (idx, node) in bucket.nodes().iter().enumerate() {
                        if p.servers.is_empty() || p.servers.contains(&idx) {
                            node.faults().set_fail(code, p.count, p.opcode);
                        }
                    }
                }
                Ok(Value::Null)
            }
            "SET_CCCP" => {
                let p: EnabledPayload = parse(payload)?;
                for bucket in self.buckets(p.bucket.as_deref())? {
                    bucket.nodes().iter().for_each(|n| n.settings().set_cccp(p.enabled));
                }
                Ok(Value::Null)
            }
            "SET_ENHANCED_ERRORS" => {
                let p: EnabledPayload = parse(payload)?;
                for bucket in self.buckets(p.bucket.as_deref())? {
                    bucket
                        .nodes()
                        .iter()
                        .for_each(|n| n.settings().set_enhanced_errors(p.enabled));
                }
                Ok(Value::Null)
            }
            "SET_COMPRESSION" => {
                let p: CompressionPayload = parse(payload)?;
                for bucket in self.buckets(p.bucket.as_deref())? {
                    bucket.nodes().iter().for_each(|n| n.settings().set_compression(p.mode));
                }
                Ok(Value::Null)
            }
            "SET_PERSIST" | "SET_REPLICATE" => {
                let p: EnabledPayload = parse(payload)?;
                for bucket in self.buckets(p.bucket.as_deref())? {
                    for node in bucket.nodes() {
                        if command == "SET_PERSIST" {
                            node.storage().set_persist_enabled(p.enabled);
                        } else {
                            node.storage().set_replication_enabled(p.enabled);
                        }
                    }
                }
                Ok(Value::Null)
            }
            "KEYINFO" => self.key_info(parse(payload)?),
            "TIME_TRAVEL" => {
                let p: TimeTravelPayload = parse(payload)?;
                self.cluster.time_travel(p.offset);
                Ok(Value::Null)
            }
            "GET_MCPORTS" => {
                let p: BucketPayload = parse(payload)?;
                Ok(json!(self.cluster.bucket(p.bucket.as_deref())?.ports()))
            }
            "START_CMDLOG" | "STOP_CMDLOG" | "GET_CMDLOG" => {
                let p: NodePayload = parse(payload)?;
                let bucket = self.cluster.bucket(p.bucket.as_deref())?;
                let faults = bucket.node(p.idx)?.faults();
                match command {
                    "START_CMDLOG" => {
                        faults.start_cmdlog();
                        Ok(Value::Null)
                    }
                    "STOP_CMDLOG" => {
                        faults.stop_cmdlog();
                        Ok(Value::Null)
                    }
                    _ => {
                        let log = faults
                            .cmdlog()
                            .ok_or_else(|| MockError::control("command log is not running"))?;
                        serde_json::to_value(log).map_err(|e| MockError::control(e.to_string()))
                    }
                }
            }
            "MOCKINFO" => Ok(self.mock_info()),
            "HELP" => Ok(json!(COMMANDS)),
            other => Err(MockError::control(format!("unknown command: {}", other))),
        }
    }

    fn buckets(&self, name: Option<&str>) -> MockResult<Vec<Arc<Bucket>>> {
        match name {
            Some(_) => Ok(vec![self.cluster.bucket(name)?]),
            None => Ok(self.cluster.buckets().to_vec()),
        }
    }

    fn key_spec(&self, bucket: &Bucket, key: &str) -> KeySpec {
        KeySpec::new(key.as_bytes().to_vec(), bucket.vbucket_for_key(key.as_bytes()))
    }

    /// Apply a cache or disk change to the vbucket's master and/or replicas.
    fn key_action(&self, action: KeyAction, p: KeyPayload) -> MockResult<Value> {
        let bucket = self.cluster.bucket(p.bucket.as_deref())?;
        let ks = self.key_spec(&bucket, &p.key);
        let info = bucket
            .map()
            .get(ks.vbucket)
            .ok_or_else(|| MockError::storage(format!("invalid vbucket {}", ks.vbucket)))?;
        let owner = info
            .owner
            .ok_or_else(|| MockError::storage(format!("vbucket {} has no owner", ks.vbucket)))?;

        let mut targets: Vec<usize> = Vec::new();
        if p.on_master {
            targets.push(owner);
        }
        match &p.on_replicas {
            ReplicaSelector::Indexes(indexes) => {
                for &i in indexes {
                    let node = *info
                        .replicas
                        .get(i)
                        .ok_or_else(|| MockError::control(format!("no replica at index {}", i)))?;
                    if !targets.contains(&node) {
                        targets.push(node);
                    }
                }
            }
            ReplicaSelector::Count(count) => {
                let active = info
                    .replicas
                    .iter()
                    .copied()
                    .filter(|&r| bucket.nodes().get(r).is_some_and(|n| n.is_active()))
                    .take(*count);
                targets.extend(active);
            }
        }

        let master = bucket.node(owner)?.storage();
        let value = p.value.unwrap_or_default();
        let source = master
            .get_cached(&ks)
            .unwrap_or_else(|| Item::new(ks.clone(), 0, 0, value.clone().into_bytes(), p.cas.max(0) as u64));
        let item = match p.cas {
            0 => source,
            cas => {
                let cas = if cas < 0 { (source.cas + 1) * 2 } else { cas as u64 };
                Item::new(ks.clone(), source.flags, source.expiry, value.into_bytes(), cas)
            }
        };

        for idx in &targets {
            action.apply(bucket.node(*idx)?.storage(), &item);
        }
        tracing::debug!(key = %p.key, ?action, nodes = ?targets, "key action applied");
        Ok(Value::Null)
    }

    /// Per-node view of one key, `null` for nodes holding no copy of its vbucket.
    fn key_info(&self, p: KeyPayload) -> MockResult<Value> {
        let bucket = self.cluster.bucket(p.bucket.as_deref())?;
        let ks = self.key_spec(&bucket, &p.key);
        let info = bucket
            .map()
            .get(ks.vbucket)
            .ok_or_else(|| MockError::storage(format!("invalid vbucket {}", ks.vbucket)))?;

        let describe = |item: Option<Item>| -> Value {
            item.and_then(|i| serde_json::to_value(i.describe()).ok())
                .unwrap_or_else(|| json!({}))
        };

        let nodes = bucket
            .nodes()
            .iter()
            .map(|node| {
                let idx = node.index();
                let conf = if info.is_owner(idx) {
                    json!({"Type": "master", "Index": 0})
                } else if let Some(r) = info.replica_index(idx) {
                    json!({"Type": "replica", "Index": r + 1})
                } else {
                    return Value::Null;
                };
                let storage = node.storage();
                json!({
                    "Conf": conf,
                    "Cache": describe(storage.get_cached(&ks)),
                    "Disk": describe(storage.get_persisted(&ks)),
                })
            })
            .collect();
        Ok(Value::Array(nodes))
    }

    fn mock_info(&self) -> Value {
        let buckets: Map<String, Value> = self
            .cluster
            .buckets()
            .iter()
            .map(|b| {
                let info = json!({
                    "type": b.bucket_type().to_string(),
                    "uuid": b.uuid(),
                    "rev": b.rev(),
                    "ports": b.ports(),
                    "active": b.active_nodes(),
                });
                (b.name().to_string(), info)
            })
            .collect();
        json!({
            "version": crate::adapters::memcached::commands::other::MOCK_VERSION,
            "buckets": buckets,
            "MOCK": COMMANDS,
        })
    }
}

/// Nodes addressed by an optional index.
fn select_nodes(bucket: &Bucket, idx: Option<usize>) -> MockResult<Vec<usize>> {
    match idx {
        Some(idx) => {
            bucket.node(idx)?;
            Ok(vec![idx])
        }
        None => Ok((0..bucket.nodes().len()).collect()),
    }
}
