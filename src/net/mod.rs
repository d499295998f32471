//! Networking layer.
//!
//! - [`tcp`] - TCP listener abstraction shared by every server
//! - [`listeners`] - Control channel listener

pub mod listeners;
pub mod tcp;

pub use listeners::{ControlListener, ControlListenerConfig};
