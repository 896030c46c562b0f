//! Fleet inventory
//!
//! Read-side queries joining compute instances with their container cluster
//! registrations, plus the tag/stop/terminate operations every reclaiming path shares.

use chrono::{DateTime, Utc};
use ecsfleet_core::{
    ClusterInfo, ComputeApi, ComputeInstance, ContainerClusterApi, ContainerInstanceRecord,
    InstanceFilter, InstanceState, Platform, RegisteredInstance, millis_tag_value, tags,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ClusterSettings;
use crate::error::{OrchestratorError, Result};

/// States of instances still owned by the fleet
const OWNED_STATES: [InstanceState; 4] = [
    InstanceState::Pending,
    InstanceState::Running,
    InstanceState::Stopping,
    InstanceState::Stopped,
];

/// Shared view of the cluster's compute capacity
#[derive(Clone)]
pub struct Inventory {
    compute: Arc<dyn ComputeApi>,
    cluster: Arc<dyn ContainerClusterApi>,
    clock: Arc<dyn Clock>,
}

impl Inventory {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        cluster: Arc<dyn ContainerClusterApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            compute,
            cluster,
            clock,
        }
    }

    pub fn compute(&self) -> &Arc<dyn ComputeApi> {
        &self.compute
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Fail unless the container cluster exists
    pub async fn ensure_cluster_exists(&self, settings: &ClusterSettings) -> Result<ClusterInfo> {
        self.cluster
            .describe_cluster(&settings.cluster_name)
            .await?
            .ok_or_else(|| OrchestratorError::ClusterNotFound(settings.cluster_name.clone()))
    }

    pub async fn container_instances(
        &self,
        settings: &ClusterSettings,
    ) -> Result<Vec<ContainerInstanceRecord>> {
        Ok(self
            .cluster
            .list_container_instances(&settings.cluster_name)
            .await?)
    }

    /// Compute instances backing `records`
    pub async fn instances_for(
        &self,
        records: &[ContainerInstanceRecord],
    ) -> Result<Vec<ComputeInstance>> {
        if records.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<String> = records.iter().map(|r| r.ec2_instance_id.clone()).collect();
        Ok(self.compute.describe_instances_by_id(&ids).await?)
    }

    /// Every cluster member joined with its compute instance
    pub async fn registered_instances(
        &self,
        settings: &ClusterSettings,
    ) -> Result<Vec<RegisteredInstance>> {
        let records = self.container_instances(settings).await?;
        let instances = self.instances_for(&records).await?;
        Ok(join(instances, records))
    }

    /// Instances created for this cluster that are registered or were launched by this server
    pub async fn all_instances(&self, settings: &ClusterSettings) -> Result<Vec<ComputeInstance>> {
        let records = self.container_instances(settings).await?;
        let filter = InstanceFilter::new()
            .with_tag(tags::CREATOR, tags::CREATOR_ID)
            .with_states(&OWNED_STATES);

        let instances = self.compute.describe_instances(&filter).await?;
        Ok(instances
            .into_iter()
            .filter(|instance| {
                records.iter().any(|r| r.ec2_instance_id == instance.id)
                    || instance.tag(tags::SERVER_ID) == Some(settings.server_id.as_str())
            })
            .collect())
    }

    pub async fn all_on_demand_instances(
        &self,
        settings: &ClusterSettings,
    ) -> Result<Vec<ComputeInstance>> {
        let mut instances = self.all_instances(settings).await?;
        instances.retain(|i| !i.is_spot());
        Ok(instances)
    }

    /// On-demand instances of one platform carrying the fleet's instance name
    pub async fn on_demand_instances_for_platform(
        &self,
        settings: &ClusterSettings,
        platform: Platform,
    ) -> Result<Vec<ComputeInstance>> {
        let name = tags::on_demand_instance_name(&settings.cluster_name, platform);
        let mut instances = self.all_on_demand_instances(settings).await?;
        instances.retain(|i| i.platform == platform && i.name() == Some(name.as_str()));
        Ok(instances)
    }

    /// Stamp `last-seen-idle` on the instance when its registration reports no task.
    ///
    /// Returns whether the tag was written.
    pub async fn mark_idle(&self, settings: &ClusterSettings, instance_id: &str) -> Result<bool> {
        let records = self.container_instances(settings).await?;
        let Some(record) = records.iter().find(|r| r.ec2_instance_id == instance_id) else {
            debug!(instance_id, "Instance is not registered, not marking idle");
            return Ok(false);
        };

        if !record.is_idle() {
            return Ok(false);
        }

        let now = millis_tag_value(self.now());
        self.compute
            .create_tags(
                &[instance_id.to_string()],
                &[(tags::LAST_SEEN_IDLE.to_string(), now)],
            )
            .await?;
        debug!(instance_id, "Marked instance idle");
        Ok(true)
    }

    pub async fn remove_idle_tag(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        self.compute
            .delete_tags(instance_ids, &[tags::LAST_SEEN_IDLE])
            .await?;
        Ok(())
    }

    /// Tag `stopped-at` and stop
    pub async fn stop(&self, instances: &[RegisteredInstance]) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = instances.iter().map(|i| i.id().to_string()).collect();
        let now = millis_tag_value(self.now());
        self.compute
            .create_tags(&ids, &[(tags::STOPPED_AT.to_string(), now)])
            .await?;
        self.compute.stop_instances(&ids).await?;

        info!(instances = ?ids, "Stopped instances");
        Ok(())
    }

    /// Deregister whatever registrations the instances still have, then terminate them
    pub async fn terminate(&self, settings: &ClusterSettings, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }

        let records = self.container_instances(settings).await?;
        for record in records
            .iter()
            .filter(|r| instance_ids.contains(&r.ec2_instance_id))
        {
            self.deregister(settings, record).await?;
        }

        self.compute.terminate_instances(instance_ids).await?;
        info!(cluster = %settings.cluster_name, instances = ?instance_ids, "Terminated instances");
        Ok(())
    }

    /// Deregister and terminate registered instances, without re-listing the cluster
    pub async fn terminate_registered(
        &self,
        settings: &ClusterSettings,
        instances: &[RegisteredInstance],
    ) -> Result<()> {
        if instances.is_empty() {
            return Ok(());
        }

        for instance in instances {
            self.deregister(settings, &instance.container).await?;
        }

        let ids: Vec<String> = instances.iter().map(|i| i.id().to_string()).collect();
        self.compute.terminate_instances(&ids).await?;
        info!(cluster = %settings.cluster_name, instances = ?ids, "Terminated instances");
        Ok(())
    }

    /// Best-effort deregistration; every error is logged and dropped
    pub async fn deregister_quietly(&self, settings: &ClusterSettings, instance_ids: &[String]) {
        if instance_ids.is_empty() {
            return;
        }

        let records = match self.container_instances(settings).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Could not list container instances to deregister");
                return;
            }
        };

        for record in records
            .iter()
            .filter(|r| instance_ids.contains(&r.ec2_instance_id))
        {
            if let Err(e) = self
                .cluster
                .deregister_container_instance(&settings.cluster_name, &record.arn)
                .await
            {
                warn!(arn = %record.arn, error = %e, "Failed to deregister container instance");
            }
        }
    }

    async fn deregister(
        &self,
        settings: &ClusterSettings,
        record: &ContainerInstanceRecord,
    ) -> Result<()> {
        match self
            .cluster
            .deregister_container_instance(&settings.cluster_name, &record.arn)
            .await
        {
            Ok(()) => {
                debug!(arn = %record.arn, "Deregistered container instance");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(arn = %record.arn, "Container instance already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Pair instances with their registrations, dropping instances without one
pub(crate) fn join(
    instances: Vec<ComputeInstance>,
    records: Vec<ContainerInstanceRecord>,
) -> Vec<RegisteredInstance> {
    let mut by_instance: HashMap<String, ContainerInstanceRecord> = records
        .into_iter()
        .map(|r| (r.ec2_instance_id.clone(), r))
        .collect();

    instances
        .into_iter()
        .filter_map(|instance| {
            by_instance
                .remove(&instance.id)
                .map(|record| RegisteredInstance::new(instance, record))
        })
        .collect()
}
