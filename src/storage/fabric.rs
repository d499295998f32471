//! Replication and persistence fabric.
//!
//! [`Storage`] is one node's view of a bucket: its item cache, its simulated
//! persisted copy, and handles to the other nodes' storage. Every store
//! operation goes through [`Storage::apply`], which mirrors the events the
//! operation produced:
//!
//! ```text
//!   active node                         replica node
//!   ┌───────────────┐  force_mutation   ┌───────────────┐
//!   │ VBucketStore  │ ────────────────► │ VBucketStore  │
//!   └──────┬────────┘                   └──────┬────────┘
//!          │ persist                           │ persist
//!          ▼                                   ▼
//!   ┌───────────────┐                   ┌───────────────┐
//!   │PersistedStore │                   │PersistedStore │
//!   └───────────────┘                   └───────────────┘
//! ```
//!
//! Replication is synchronous: when `apply` returns, every replica has the
//! mutation. Either leg can be switched off to manufacture dirty states.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::control::placement::VBucketMap;
use crate::core::config::BucketType;
use crate::core::error::ErrorCode;
use crate::core::time::Clock;
use crate::storage::item::{Item, KeySpec};
use crate::storage::persisted::PersistedStore;
use crate::storage::vbucket_store::{Applied, StoreEvent, VBucketCoordinates, VBucketStore};

/// Which role a node must hold for a vbucket to serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Active owner only.
    Owner,
    /// Active owner or any replica.
    OwnerOrReplica,
}

/// Storage handles of every node in a bucket, indexed by node.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<Vec<Weak<Storage>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, storage: &Arc<Storage>) {
        let mut peers = self.peers.write();
        let idx = storage.node();
        if peers.len() <= idx {
            peers.resize_with(idx + 1, Weak::new);
        }
        peers[idx] = Arc::downgrade(storage);
    }

    pub fn get(&self, node: usize) -> Option<Arc<Storage>> {
        self.peers.read().get(node).and_then(Weak::upgrade)
    }
}

/// Observe state of one key on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyState {
    NotPersisted = 0x00,
    Persisted = 0x01,
    NotFound = 0x80,
    LogicallyDeleted = 0x81,
}

/// Answer to an observe-seqno request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqnoObservation {
    /// The client's uuid is current.
    Current {
        vbucket: u16,
        uuid: u64,
        persisted_seqno: u64,
        current_seqno: u64,
    },
    /// The client's uuid was superseded by a failover.
    Failover {
        vbucket: u16,
        uuid: u64,
        persisted_seqno: u64,
        current_seqno: u64,
        old_uuid: u64,
        old_seqno: u64,
    },
}

/// One node's storage for one bucket.
pub struct Storage {
    node: usize,
    bucket_type: BucketType,
    cache: VBucketStore,
    persisted: PersistedStore,
    persist_enabled: AtomicBool,
    replication_enabled: AtomicBool,
    map: Arc<VBucketMap>,
    peers: Arc<PeerTable>,
}

impl Storage {
    /// Create storage for `node` and register it with its peers.
    pub fn new(
        node: usize,
        bucket_type: BucketType,
        map: Arc<VBucketMap>,
        peers: Arc<PeerTable>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let uuids = map.uuids();
        let storage = Arc::new(Self {
            node,
            bucket_type,
            cache: VBucketStore::new(&uuids, clock),
            persisted: PersistedStore::new(uuids.len()),
            persist_enabled: AtomicBool::new(true),
            replication_enabled: AtomicBool::new(true),
            map,
            peers: peers.clone(),
        });
        peers.register(&storage);
        storage
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    pub fn map(&self) -> &Arc<VBucketMap> {
        &self.map
    }

    pub fn clock(&self) -> &dyn Clock {
        self.cache.clock()
    }

    /// Raw cache handle without an ownership check.
    pub fn cache(&self) -> &VBucketStore {
        &self.cache
    }

    /// Cache handle after checking this node may serve `vbucket`.
    pub fn cache_for(&self, vbucket: u16, access: Access) -> Result<&VBucketStore, ErrorCode> {
        self.check_access(vbucket, access)?;
        Ok(&self.cache)
    }

    pub fn check_access(&self, vbucket: u16, access: Access) -> Result<(), ErrorCode> {
        if self.bucket_type == BucketType::Memcached {
            return Ok(());
        }
        let info = self.map.get(vbucket).ok_or(ErrorCode::NotMyVbucket)?;
        let allowed = match access {
            Access::Owner => info.is_owner(self.node),
            Access::OwnerOrReplica => info.has_access(self.node),
        };
        if allowed {
            Ok(())
        } else {
            Err(ErrorCode::NotMyVbucket)
        }
    }

    pub fn set_persist_enabled(&self, enabled: bool) {
        self.persist_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_replication_enabled(&self, enabled: bool) {
        self.replication_enabled.store(enabled, Ordering::Release);
    }

    pub fn persist_enabled(&self) -> bool {
        self.persist_enabled.load(Ordering::Acquire)
    }

    pub fn replication_enabled(&self) -> bool {
        self.replication_enabled.load(Ordering::Acquire)
    }

    /// Propagate the events of a store operation and return its value.
    pub fn apply<T>(&self, applied: Applied<T>) -> T {
        for event in &applied.events {
            self.propagate(event);
        }
        applied.value
    }

    fn propagate(&self, event: &StoreEvent) {
        let persist = self.persist_enabled();
        let replicate = self.replication_enabled() && self.owns(event.key_spec().vbucket);
        match event {
            StoreEvent::Mutated { item, coords } => {
                if persist {
                    self.persisted.put(item.clone(), *coords);
                }
                if replicate {
                    for replica in self.replicas_of(item.key_spec.vbucket) {
                        let applied = replica.cache.force_mutation(item.clone(), *coords);
                        replica.apply(applied);
                    }
                }
            }
            StoreEvent::Deleted { key_spec, coords } => {
                if persist {
                    self.persisted.remove(key_spec, *coords);
                }
                if replicate {
                    for replica in self.replicas_of(key_spec.vbucket) {
                        let applied = replica.cache.force_delete(key_spec, *coords);
                        replica.apply(applied);
                        // replicas keep a tombstone on disk so observe reports
                        // the key as logically deleted
                        replica
                            .persisted
                            .put(Item::tombstone(key_spec.clone()), *coords);
                    }
                }
            }
        }
    }

    fn owns(&self, vbucket: u16) -> bool {
        self.bucket_type == BucketType::Couchbase
            && self.map.get(vbucket).is_some_and(|i| i.is_owner(self.node))
    }

    fn replicas_of(&self, vbucket: u16) -> Vec<Arc<Storage>> {
        self.map
            .get(vbucket)
            .map(|info| {
                info.replicas
                    .iter()
                    .filter(|r| **r != self.node)
                    .filter_map(|r| self.peers.get(*r))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Compare cache and disk for one key.
    pub fn observe(&self, ks: &KeySpec) -> Result<(KeyState, u64), ErrorCode> {
        self.check_access(ks.vbucket, Access::OwnerOrReplica)?;
        let cached = self.cache.peek(ks).filter(|i| !i.is_expired(self.cache.now()));
        let persisted = self.persisted.get(ks);
        let state = match (cached, persisted) {
            (None, None) => (KeyState::NotFound, 0),
            (None, Some(_)) => (KeyState::LogicallyDeleted, 0),
            (Some(c), Some(p)) if c.cas == p.cas => (KeyState::Persisted, c.cas),
            (Some(c), _) => (KeyState::NotPersisted, c.cas),
        };
        Ok(state)
    }

    /// Resolve a client's (vbucket, uuid) against this node's history.
    pub fn observe_seqno(&self, vbucket: u16, uuid: u64) -> Result<SeqnoObservation, ErrorCode> {
        if self.bucket_type == BucketType::Couchbase && self.map.get(vbucket).is_none() {
            return Err(ErrorCode::NotMyVbucket);
        }
        let requested = self
            .cache
            .find_coords(vbucket, uuid)
            .ok_or(ErrorCode::Einternal)?;
        let current = self.cache.current_coords(vbucket);
        let persisted_seqno = self.persisted.coords(vbucket).seqno;
        if requested.uuid != current.uuid {
            Ok(SeqnoObservation::Failover {
                vbucket,
                uuid: current.uuid,
                persisted_seqno,
                current_seqno: current.seqno,
                old_uuid: requested.uuid,
                old_seqno: requested.seqno,
            })
        } else {
            Ok(SeqnoObservation::Current {
                vbucket,
                uuid: requested.uuid,
                persisted_seqno,
                current_seqno: requested.seqno,
            })
        }
    }

    /// Adopt new vbucket uuids after a topology change.
    pub fn update_coords(&self, uuids: &[u64]) {
        self.cache.update_coords(uuids);
        for vb in 0..uuids.len() {
            let coords = self.cache.current_coords(vb as u16);
            self.persisted.update_coords(vb as u16, coords);
        }
    }

    pub fn persisted_coords(&self, vbucket: u16) -> VBucketCoordinates {
        self.persisted.coords(vbucket)
    }

    pub fn get_cached(&self, ks: &KeySpec) -> Option<Item> {
        self.cache.peek(ks)
    }

    pub fn get_persisted(&self, ks: &KeySpec) -> Option<Item> {
        self.persisted.get(ks)
    }

    /// Write directly into the cache without bumping CAS or coordinates.
    pub fn put_cached(&self, item: Item) {
        self.cache.put_raw(item);
    }

    /// Write directly to disk without touching the cache.
    pub fn put_persisted(&self, item: Item) {
        self.persisted.put(item, VBucketCoordinates::default());
    }

    pub fn remove_cached(&self, ks: &KeySpec) {
        self.cache.remove_raw(ks);
    }

    pub fn remove_persisted(&self, ks: &KeySpec) {
        self.persisted.remove(ks, VBucketCoordinates::default());
    }

    /// Live items in vbuckets this node is active for.
    pub fn owned_items(&self) -> Vec<Item> {
        self.cache
            .live_items()
            .into_iter()
            .filter(|i| self.bucket_type == BucketType::Memcached || self.owns(i.key_spec.vbucket))
            .collect()
    }

    pub fn flush(&self) {
        self.cache.flush();
        self.persisted.clear();
    }
}
