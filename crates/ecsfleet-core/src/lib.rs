//! ecsfleet Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - ecsfleet-orchestrator (capacity manager, spot controller, heartbeat)
//! - the AWS adapters that back the cloud API traits
//!
//! Key types:
//! - ComputeApi / ContainerClusterApi traits (interface for the cloud inventory)
//! - Compute instance, container instance, spot request and subnet snapshots
//! - Tag keys shared with other processes acting on the same cluster
//! - Error types

pub mod error;
pub mod tags;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
