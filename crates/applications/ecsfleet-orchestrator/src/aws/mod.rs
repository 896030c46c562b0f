//! AWS implementations of the cloud API seams

mod ec2;
mod ecs;

pub use ec2::Ec2Compute;
pub use ecs::EcsCluster;

use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_types::SdkConfig;
use aws_types::region::Region;
use ecsfleet_core::ApiError;
use std::error::Error as StdError;
use std::fmt::Debug;

/// Load the shared SDK configuration, pinned to `region` when given
pub async fn load_sdk_config(region: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    loader.load().await
}

/// Classify an SDK error by its service error code
pub(crate) fn api_error<E, R>(operation: &str, err: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    ApiError::from_code(operation, code, message)
}

/// `None` for an empty list, so optional SDK parameters stay unset
fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}
