//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Cluster and listener lifecycle
//! - [`time`] - Mock clock with time travel
//! - [`error`] - Error types and wire status codes

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
