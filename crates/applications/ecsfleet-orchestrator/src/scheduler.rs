//! Task placement
//!
//! Entry point for a unit of work: reuse a registered instance when one fits, otherwise
//! ask for capacity. On-demand capacity comes back registered; spot capacity only
//! arrives later, so the caller retries placement once the request is fulfilled.

use ecsfleet_core::RegisteredInstance;
use std::sync::Arc;
use tracing::info;

use crate::capacity::CapacityManager;
use crate::config::{ClusterSettings, ContainerSpec, ElasticProfile, ResolvedInstanceConfig};
use crate::error::{OrchestratorError, Result};
use crate::inventory::Inventory;
use crate::spot::SpotInstanceController;
use crate::strategy::InstanceSelector;

/// Outcome of a placement decision
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// An already registered instance has room for the task
    Existing(RegisteredInstance),
    /// A stopped instance was restarted or a new one launched for the task
    Provisioned(RegisteredInstance),
    /// A spot instance was requested (or one is already on its way)
    SpotRequested,
}

impl Placement {
    pub fn instance(&self) -> Option<&RegisteredInstance> {
        match self {
            Placement::Existing(instance) | Placement::Provisioned(instance) => Some(instance),
            Placement::SpotRequested => None,
        }
    }
}

pub struct TaskScheduler {
    inventory: Inventory,
    capacity: Arc<CapacityManager>,
    spot: Arc<SpotInstanceController>,
}

impl TaskScheduler {
    pub fn new(
        inventory: Inventory,
        capacity: Arc<CapacityManager>,
        spot: Arc<SpotInstanceController>,
    ) -> Self {
        Self {
            inventory,
            capacity,
            spot,
        }
    }

    /// Find or provision an instance for a task needing `spec`
    pub async fn place(
        &self,
        settings: &ClusterSettings,
        profile: &ElasticProfile,
        spec: &ContainerSpec,
    ) -> Result<Placement> {
        let config = ResolvedInstanceConfig::resolve(settings, profile)?;
        let platform = config.platform;

        let selector = InstanceSelector::for_platform(settings, platform, self.inventory.clone());
        if let Some(instance) = selector.instance_for_scheduling(settings, &config, spec).await? {
            info!(%platform, instance_id = %instance.id(), "Placing task on registered instance");
            return Ok(Placement::Existing(instance));
        }

        if config.run_as_spot {
            self.spot.request_spot_capacity(settings, &config).await?;
            return Ok(Placement::SpotRequested);
        }

        let instance = self
            .capacity
            .ensure_instances(settings, &config, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(OrchestratorError::NoInstanceAvailable { platform })?;

        info!(%platform, instance_id = %instance.id(), "Placing task on provisioned instance");
        Ok(Placement::Provisioned(instance))
    }

    /// A task finished on the instance; mark it idle when nothing else runs there
    pub async fn job_completed(&self, settings: &ClusterSettings, instance_id: &str) -> Result<bool> {
        self.inventory.mark_idle(settings, instance_id).await
    }
}
