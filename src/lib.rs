//! cbmock - mock Couchbase cluster speaking the memcached binary protocol.
//!
//! cbmock runs a whole cluster in one process: every node of every bucket
//! listens on its own port, vbuckets are spread across nodes with replicas,
//! and mutations propagate to replicas and a simulated disk. SDK test suites
//! drive failures through a JSON control channel: forced error codes,
//! stalled or truncated writes, failover and respawn.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Clients                               │
//! │        SDK under test (binary)    │   harness (JSON lines)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                  │                                 │
//! ┌──────────────────────────────────┐ ┌────────────────────────────┐
//! │ NodeServer per (bucket, node)    │ │ ControlListener            │
//! │ codec → Dispatcher → handlers    │ │ ControlHandler             │
//! └──────────────────────────────────┘ └────────────────────────────┘
//!                  │                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Cluster → Bucket → Node                         │
//! │      VBucketMap │ FaultState │ NodeSettings │ cluster maps      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Storage (one per node)                          │
//! │  VBucketStore (CAS, locks, seqnos) │ PersistedStore │ fabric    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Cluster and listener lifecycle
//! - [`core::time`] - Mock clock with time travel
//! - [`core::error`] - Error types and wire status codes
//!
//! ## Control
//! - [`control::cluster`] - Buckets, nodes, failover, cluster maps
//! - [`control::placement`] - VBucket ownership
//! - [`control::routing`] - Key hashing and node addresses
//! - [`control::faults`] - Fault injection state
//! - [`control::api`] - Control channel commands
//!
//! ## Storage
//! - [`storage::vbucket_store`] - Per-vbucket items, CAS and coordinates
//! - [`storage::fabric`] - Replication, persistence and observe
//!
//! ## Sub-document
//! - [`subdoc`] - Path parsing and JSON mutation engine
//!
//! ## Adapters
//! - [`adapters::memcached`] - Binary protocol codec, commands and servers
//!
//! ## Networking
//! - [`net::tcp`] - TCP listener abstraction
//! - [`net::listeners`] - Control channel listener
//!
//! # Key Invariants
//!
//! - **CAS**: every mutation yields a CAS greater than any before it on the node
//! - **Ownership**: only the active owner of a vbucket accepts its mutations
//! - **Propagation**: replicas and disk see a mutation before its response is
//!   sent, unless turned off from the control channel

// Core infrastructure
pub mod core;

// Cluster topology and fault injection
pub mod control;

// Storage layer
pub mod storage;

// Sub-document engine
pub mod subdoc;

// Protocol adapters
pub mod adapters;

// Networking
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use control::{api, cluster, faults, placement, routing};
pub use net::listeners;
