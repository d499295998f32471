//! VBucket placement.
//!
//! Every bucket has a fixed number of vbuckets. Each one has at most one
//! active owner and an ordered list of replica nodes, plus the uuid that
//! identifies the current ownership epoch. Nodes are referred to by their
//! index within the bucket.

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on replicas per vbucket.
pub const REPLICAS_MAX: usize = 3;

/// Placement record for one vbucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketInfo {
    /// Active node, if any node is up.
    pub owner: Option<usize>,

    /// Replica nodes in replication order.
    pub replicas: Vec<usize>,

    /// Current failover uuid.
    pub uuid: u64,
}

impl VBucketInfo {
    fn new() -> Self {
        Self {
            owner: None,
            replicas: Vec::new(),
            uuid: generate_uuid(),
        }
    }

    pub fn is_owner(&self, node: usize) -> bool {
        self.owner == Some(node)
    }

    pub fn is_replica(&self, node: usize) -> bool {
        self.replicas.contains(&node)
    }

    /// Owner or replica.
    pub fn has_access(&self, node: usize) -> bool {
        self.is_owner(node) || self.is_replica(node)
    }

    /// Index of `node` in the replica list.
    pub fn replica_index(&self, node: usize) -> Option<usize> {
        self.replicas.iter().position(|r| *r == node)
    }
}

/// Placement table for one bucket.
#[derive(Debug)]
pub struct VBucketMap {
    entries: RwLock<Vec<VBucketInfo>>,
    num_replicas: usize,
}

impl VBucketMap {
    /// Create an unassigned map. Call [`VBucketMap::rebalance`] to place it.
    pub fn new(num_vbuckets: usize, num_replicas: usize) -> Self {
        Self {
            entries: RwLock::new((0..num_vbuckets).map(|_| VBucketInfo::new()).collect()),
            num_replicas: num_replicas.min(REPLICAS_MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn get(&self, vbucket: u16) -> Option<VBucketInfo> {
        self.entries.read().get(vbucket as usize).cloned()
    }

    pub fn snapshot(&self) -> Vec<VBucketInfo> {
        self.entries.read().clone()
    }

    pub fn uuids(&self) -> Vec<u64> {
        self.entries.read().iter().map(|e| e.uuid).collect()
    }

    /// Vbuckets for which `node` is the active owner.
    pub fn owned_by(&self, node: usize) -> Vec<u16> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_owner(node))
            .map(|(vb, _)| vb as u16)
            .collect()
    }

    /// Reassign owners round-robin over `active` nodes, with the following
    /// active nodes as replicas. Every vbucket gets a new uuid.
    ///
    /// Returns the new uuids, indexed by vbucket.
    pub fn rebalance(&self, active: &[usize]) -> Vec<u64> {
        let mut entries = self.entries.write();
        let replicas = self.num_replicas.min(active.len().saturating_sub(1));
        for (vb, entry) in entries.iter_mut().enumerate() {
            if active.is_empty() {
                entry.owner = None;
                entry.replicas.clear();
            } else {
                let base = vb % active.len();
                entry.owner = Some(active[base]);
                entry.replicas = (1..=replicas)
                    .map(|offset| active[(base + offset) % active.len()])
                    .collect();
            }
            entry.uuid = generate_uuid();
        }
        tracing::debug!(
            vbuckets = entries.len(),
            active = active.len(),
            replicas,
            "vbucket map rebalanced"
        );
        entries.iter().map(|e| e.uuid).collect()
    }

    /// Give every vbucket a new uuid without moving it.
    pub fn regenerate_uuids(&self) -> Vec<u64> {
        let mut entries = self.entries.write();
        for entry in entries.iter_mut() {
            entry.uuid = generate_uuid();
        }
        entries.iter().map(|e| e.uuid).collect()
    }
}

/// Random non-zero vbucket uuid. Zero means "unset" to the persisted store.
pub fn generate_uuid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let uuid: u64 = rng.gen();
        if uuid != 0 {
            return uuid;
        }
    }
}
