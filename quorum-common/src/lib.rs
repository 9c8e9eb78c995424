//! Shared types for the quorum replication workspace: identifiers, cluster and
//! timing configuration, the error type and the metrics hook.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use error::{QuorumError, Result};
