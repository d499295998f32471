//! Cluster control.
//!
//! ```text
//!   Cluster ──► Bucket ──► Node ──► Storage
//!                 │          ├────► FaultState
//!                 │          └────► NodeSettings
//!                 └──► VBucketMap (owner + replicas per vbucket)
//! ```
//!
//! - [`cluster`] - Buckets, nodes, failover and cluster maps
//! - [`placement`] - VBucket ownership and coordinates
//! - [`routing`] - Key hashing and node addresses
//! - [`faults`] - Forced errors, write hiccups and command logs
//! - [`api`] - Control channel commands
//!
//! # Invariants
//!
//! - Every vbucket has exactly one active owner while any node is up
//! - A failed-over node owns nothing and appears in no replica list
//! - Each topology change bumps the bucket revision

pub mod api;
pub mod cluster;
pub mod faults;
pub mod placement;
pub mod routing;
