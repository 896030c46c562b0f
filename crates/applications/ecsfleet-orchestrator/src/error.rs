//! Error types for the orchestrator

use ecsfleet_core::{ApiError, Platform};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// On-demand ceiling reached for the platform
    #[error(
        "The number of {platform} EC2 instances is currently at the maximum permissible limit ({max}). Not creating any more instances."
    )]
    CapacityExceeded { platform: Platform, max: u32 },

    /// Spot ceiling (running spot instances plus pending requests) reached
    #[error(
        "The number of {platform} EC2 spot instances is currently at the maximum permissible limit ({max}). Not requesting any more spot instances."
    )]
    SpotCapacityExceeded { platform: Platform, max: u32 },

    /// Not a single instance of a batch registered with the cluster
    #[error(
        "EC2 instance(s) failed to register with the ECS cluster {cluster} within {}. Terminated unregistered instance(s).",
        format_timeout(.timeout)
    )]
    RegistrationTimedOut { cluster: String, timeout: Duration },

    /// None of the configured subnets is available
    #[error("None of the subnets is available to launch an EC2 instance from list {}", .0.join(","))]
    SubnetUnavailable(Vec<String>),

    /// ECS cluster does not exist
    #[error("Cluster {0} not found")]
    ClusterNotFound(String),

    /// Spot request never became queryable by id and was cancelled
    #[error("Spot request {0} could not be looked up by id and was cancelled")]
    SpotRequestNotVisible(String),

    /// Nothing to place a task on after provisioning
    #[error("No {platform} container instance available to schedule the task")]
    NoInstanceAvailable { platform: Platform },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cloud API error
    #[error(transparent)]
    Api(#[from] ApiError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for the ceiling errors, which callers are expected to surface rather than retry
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::SpotCapacityExceeded { .. }
        )
    }
}

fn format_timeout(timeout: &Duration) -> String {
    let secs = timeout.as_secs();
    match (secs / 60, secs % 60) {
        (0, s) => format!("{s}s"),
        (m, 0) => format!("{m}m"),
        (m, s) => format!("{m}m {s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_timeout_message() {
        let err = OrchestratorError::RegistrationTimedOut {
            cluster: "build".to_string(),
            timeout: Duration::from_secs(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("build"));
        assert!(msg.contains("1s"));

        let err = OrchestratorError::RegistrationTimedOut {
            cluster: "build".to_string(),
            timeout: Duration::from_secs(150),
        };
        assert!(err.to_string().contains("2m 30s"));
    }

    #[test]
    fn test_capacity_errors() {
        let err = OrchestratorError::CapacityExceeded {
            platform: Platform::Linux,
            max: 3,
        };
        assert!(err.is_capacity_exceeded());
        assert!(err.to_string().contains("LINUX"));
        assert!(!OrchestratorError::config("bad").is_capacity_exceeded());
    }
}
