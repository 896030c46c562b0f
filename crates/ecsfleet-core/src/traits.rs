//! Cloud API seams
//!
//! The orchestrator talks to the compute inventory and to the container cluster through
//! these two traits only. Implementations are expected to be thin: paging, batching and
//! error classification, no policy.

use async_trait::async_trait;

use crate::error::ApiError;
use crate::types::*;

/// Result type for cloud API calls
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Compute inventory (EC2)
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Instances
    async fn describe_instances(&self, filter: &InstanceFilter) -> ApiResult<Vec<ComputeInstance>>;
    async fn describe_instances_by_id(&self, ids: &[String]) -> ApiResult<Vec<ComputeInstance>>;
    async fn run_instances(&self, request: &RunInstancesRequest) -> ApiResult<Vec<ComputeInstance>>;
    async fn start_instances(&self, ids: &[String]) -> ApiResult<()>;
    async fn stop_instances(&self, ids: &[String]) -> ApiResult<()>;
    async fn terminate_instances(&self, ids: &[String]) -> ApiResult<()>;

    /// Tags (instances and spot requests alike)
    async fn create_tags(&self, resource_ids: &[String], tags: &[(String, String)]) -> ApiResult<()>;
    async fn delete_tags(&self, resource_ids: &[String], keys: &[&str]) -> ApiResult<()>;

    /// Spot market
    async fn request_spot_instance(&self, request: &SpotInstanceRequest) -> ApiResult<SpotRequest>;
    async fn describe_spot_requests(&self, filter: &SpotRequestFilter) -> ApiResult<Vec<SpotRequest>>;
    async fn describe_spot_requests_by_id(&self, ids: &[String]) -> ApiResult<Vec<SpotRequest>>;
    async fn cancel_spot_requests(&self, ids: &[String]) -> ApiResult<()>;

    /// Networking
    async fn describe_subnets(&self, ids: &[String]) -> ApiResult<Vec<Subnet>>;
}

/// Container cluster membership (ECS)
#[async_trait]
pub trait ContainerClusterApi: Send + Sync {
    /// `None` when the cluster does not exist
    async fn describe_cluster(&self, cluster: &str) -> ApiResult<Option<ClusterInfo>>;

    /// Every container instance registered with the cluster, fully described
    async fn list_container_instances(&self, cluster: &str) -> ApiResult<Vec<ContainerInstanceRecord>>;

    /// Forced deregistration
    async fn deregister_container_instance(&self, cluster: &str, arn: &str) -> ApiResult<()>;
}
