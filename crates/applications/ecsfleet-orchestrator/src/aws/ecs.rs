//! ECS-backed container cluster

use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::{ContainerInstance, Resource};
use aws_types::SdkConfig;
use ecsfleet_core::{ApiResult, ClusterInfo, ContainerClusterApi, ContainerInstanceRecord, Resources};
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use super::api_error;

/// DescribeContainerInstances accepts at most this many ARNs per call
const DESCRIBE_BATCH_SIZE: usize = 100;

/// [`ContainerClusterApi`] over the ECS API
#[derive(Debug, Clone)]
pub struct EcsCluster {
    client: Client,
}

impl EcsCluster {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn describe_batch(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> ApiResult<Vec<ContainerInstanceRecord>> {
        let response = self
            .client
            .describe_container_instances()
            .cluster(cluster)
            .set_container_instances(Some(arns.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("DescribeContainerInstances", e))?;

        for failure in response.failures() {
            warn!(
                "Could not describe container instance {:?}: {:?}",
                failure.arn(),
                failure.reason()
            );
        }

        Ok(response
            .container_instances()
            .iter()
            .filter_map(to_record)
            .collect())
    }
}

#[async_trait]
impl ContainerClusterApi for EcsCluster {
    async fn describe_cluster(&self, cluster: &str) -> ApiResult<Option<ClusterInfo>> {
        let response = self
            .client
            .describe_clusters()
            .clusters(cluster)
            .send()
            .await
            .map_err(|e| api_error("DescribeClusters", e))?;

        // Deleted clusters linger as INACTIVE
        Ok(response
            .clusters()
            .iter()
            .find(|c| c.status() != Some("INACTIVE"))
            .map(|c| ClusterInfo {
                name: c.cluster_name().unwrap_or(cluster).to_string(),
                arn: c.cluster_arn().unwrap_or_default().to_string(),
                status: c.status().unwrap_or_default().to_string(),
                registered_instances: u32::try_from(c.registered_container_instances_count())
                    .unwrap_or(0),
            }))
    }

    async fn list_container_instances(&self, cluster: &str) -> ApiResult<Vec<ContainerInstanceRecord>> {
        let mut arns = Vec::new();
        let mut next_token = None;
        loop {
            let response = self
                .client
                .list_container_instances()
                .cluster(cluster)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("ListContainerInstances", e))?;

            arns.extend(response.container_instance_arns().iter().cloned());

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        if arns.is_empty() {
            debug!("No container instance registered with {}", cluster);
            return Ok(vec![]);
        }

        let batches = try_join_all(
            arns.chunks(DESCRIBE_BATCH_SIZE)
                .map(|chunk| self.describe_batch(cluster, chunk)),
        )
        .await?;

        Ok(batches.into_iter().flatten().collect())
    }

    async fn deregister_container_instance(&self, cluster: &str, arn: &str) -> ApiResult<()> {
        self.client
            .deregister_container_instance()
            .cluster(cluster)
            .container_instance(arn)
            .force(true)
            .send()
            .await
            .map_err(|e| api_error("DeregisterContainerInstance", e))?;

        info!("Deregistered container instance {} from {}", arn, cluster);
        Ok(())
    }
}

fn to_record(instance: &ContainerInstance) -> Option<ContainerInstanceRecord> {
    Some(ContainerInstanceRecord {
        arn: instance.container_instance_arn()?.to_string(),
        ec2_instance_id: instance.ec2_instance_id()?.to_string(),
        agent_connected: instance.agent_connected(),
        status: instance.status().unwrap_or_default().to_string(),
        running_tasks: u32::try_from(instance.running_tasks_count()).unwrap_or(0),
        pending_tasks: u32::try_from(instance.pending_tasks_count()).unwrap_or(0),
        remaining: resources(instance.remaining_resources()),
        registered: resources(instance.registered_resources()),
    })
}

fn resources(values: &[Resource]) -> Resources {
    let value = |name: &str| {
        values
            .iter()
            .find(|r| r.name() == Some(name))
            .map(|r| i64::from(r.integer_value()))
            .unwrap_or(0)
    };

    Resources {
        cpu: value("CPU"),
        memory: value("MEMORY"),
    }
}
