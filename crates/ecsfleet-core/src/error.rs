//! Error types for the cloud API seams

use thiserror::Error;

/// Error codes that mean the target resource is already gone.
const NOT_FOUND_CODES: &[&str] = &[
    "ClusterNotFoundException",
    "InvalidInstanceID.NotFound",
    "InvalidSpotInstanceRequestID.NotFound",
    "InvalidSubnetID.NotFound",
];

/// Error returned by a [`ComputeApi`](crate::ComputeApi) or
/// [`ContainerClusterApi`](crate::ContainerClusterApi) call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The resource addressed by the call does not exist (anymore)
    #[error("{operation}: resource not found: {message}")]
    NotFound { operation: String, message: String },

    /// Any other provider error
    #[error("{operation} failed{}: {message}", code_suffix(.code))]
    Service {
        operation: String,
        code: Option<String>,
        message: String,
    },
}

impl ApiError {
    /// Create a not-found error
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a service error without a provider code
    pub fn service(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            operation: operation.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Classify a provider error by its code
    pub fn from_code(
        operation: impl Into<String>,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let operation = operation.into();
        let message = message.into();

        match code.as_deref() {
            Some(c) if is_not_found_code(c) => Self::NotFound { operation, message },
            // ECS reports a missing container instance as an invalid parameter
            Some("InvalidParameterException")
                if message.contains("not found") || message.contains("does not exist") =>
            {
                Self::NotFound { operation, message }
            }
            _ => Self::Service {
                operation,
                code,
                message,
            },
        }
    }

    /// True when the target resource was already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn is_not_found_code(code: &str) -> bool {
    NOT_FOUND_CODES.contains(&code) || code.ends_with("NotFound")
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}
