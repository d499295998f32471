//! Storage layer.
//!
//! Items live in memory only. Each node of a bucket owns a cache store and a
//! simulated persisted copy; the fabric mirrors every mutation from the
//! active node to its replicas and to disk.
//!
//! # Modules
//!
//! - [`item`] - Keys and stored documents
//! - [`vbucket_store`] - CAS, locking, expiry and (uuid, seqno) coordinates
//! - [`persisted`] - Simulated disk state
//! - [`fabric`] - Ownership checks, replication and observe
//!
//! # Invariants
//!
//! - **CAS**: strictly increasing across all vbuckets of a node
//! - **Seqno**: advances by one per mutation or deletion of a vbucket
//! - **Coordinates**: superseded uuids remain queryable for failover answers

pub mod fabric;
pub mod item;
pub mod persisted;
pub mod vbucket_store;

// Re-exports for convenience
pub use fabric::{Access, KeyState, PeerTable, SeqnoObservation, Storage};
pub use item::{datatype, Item, ItemSummary, KeySpec, LOCKED_CAS};
pub use persisted::PersistedStore;
pub use vbucket_store::{
    Applied, ArithmeticSpec, Counter, Mutation, MutationStatus, StoreEvent, VBucketCoordinates,
    VBucketStore,
};
