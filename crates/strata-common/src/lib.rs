//! Shared types for the Strata control plane
//!
//! This crate defines the fundamental identifier types, the common error
//! type, and the cluster configuration surface used by every daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::NodeId;
