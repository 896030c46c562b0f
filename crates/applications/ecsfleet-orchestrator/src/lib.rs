//! ecsfleet Orchestrator - elastic EC2 capacity for an ECS build cluster
//!
//! The orchestrator keeps a pool of EC2 instances registered with one ECS cluster
//! sized to the work at hand:
//!
//! - **Capacity**: restarts stopped instances or launches new ones for a job, within
//!   the per-platform ceilings, and waits for the container agent to register
//! - **Spot**: places one-time spot requests, remembers requests the API cannot list
//!   yet, tags fulfilled instances and reclaims idle ones
//! - **Selection**: picks an existing instance for a job, and the instances to stop
//!   when the platform has been idle long enough
//! - **Heartbeat**: periodically runs every maintenance step and keeps each platform
//!   within its configured minimum and maximum
//!
//! ## Ownership
//!
//! Everything the orchestrator launches is tagged with its creator, cluster, platform
//! and server id. Only instances carrying those tags, or registered with the cluster,
//! are ever stopped or terminated.
//!
//! ## Locking
//!
//! Launching, starting and terminating capacity of one platform happens under that
//! platform's lock, so two jobs can never push a platform past its ceiling. The spot
//! request cache has its own lock, always taken after the platform lock.

#![warn(clippy::all)]

pub mod aws;
pub mod capacity;
pub mod clock;
pub mod config;
pub mod error;
pub mod fleet;
pub mod heartbeat;
pub mod idle;
pub mod inventory;
pub mod matcher;
pub mod scheduler;
pub mod spot;
pub mod strategy;
pub mod subnet;
pub mod wait;

#[cfg(test)]
mod testing;

// ============================================================================
// Settings
// ============================================================================

pub use config::{
    ClusterSettings, ContainerSpec, ElasticProfile, PlatformSettings, ResolvedInstanceConfig,
    StopPolicy, VolumeSpec,
};
pub use error::{OrchestratorError, Result};

// ============================================================================
// Capacity and spot
// ============================================================================

pub use capacity::{CapacityManager, PlatformLocks};
pub use spot::{SpotInstanceController, UntaggedSpotRequests};
pub use strategy::{InstanceSelector, SelectionStrategy};
pub use subnet::SubnetSelector;

// ============================================================================
// Scheduling and maintenance
// ============================================================================

pub use fleet::Fleet;
pub use heartbeat::{Heartbeat, HeartbeatReport};
pub use inventory::Inventory;
pub use scheduler::{Placement, TaskScheduler};

// ============================================================================
// Runtime seams
// ============================================================================

pub use aws::{Ec2Compute, EcsCluster, load_sdk_config};
pub use clock::{Clock, SystemClock};
pub use wait::{PollResult, Poller};
