//! Instance selection strategies
//!
//! A strategy answers two questions for one platform: which registered instance should
//! take the next task, and which idle on-demand instances should be stopped. Both
//! variants share the inventory plumbing and differ only in ordering.

use ecsfleet_core::{Platform, RegisteredInstance};
use std::cmp::Reverse;
use tracing::{debug, info};

use crate::config::{ClusterSettings, ContainerSpec, ResolvedInstanceConfig, StopPolicy};
use crate::error::Result;
use crate::idle::{idle_elapsed, idle_longer_than, most_idle_ordering};
use crate::inventory::Inventory;
use crate::matcher::{container_instance_matches, instance_matches};

/// Selection strategy for scheduling and reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Schedule on the newest instance, stop the oldest idle one
    OldestInstance,
    /// Schedule on the least idle instance, stop everything idle past the threshold
    StopIdleInstance,
}

impl SelectionStrategy {
    pub fn for_policy(policy: StopPolicy) -> Self {
        match policy {
            StopPolicy::StopOldestInstance => Self::OldestInstance,
            StopPolicy::StopIdleInstance => Self::StopIdleInstance,
        }
    }

    /// Resolve a configured policy name
    pub fn from_policy_name(name: &str) -> Result<Self> {
        Ok(Self::for_policy(name.parse()?))
    }
}

/// Applies a [`SelectionStrategy`] against the live inventory
pub struct InstanceSelector {
    strategy: SelectionStrategy,
    inventory: Inventory,
}

impl InstanceSelector {
    pub fn new(strategy: SelectionStrategy, inventory: Inventory) -> Self {
        Self {
            strategy,
            inventory,
        }
    }

    /// Selector using the platform's configured stop policy
    pub fn for_platform(settings: &ClusterSettings, platform: Platform, inventory: Inventory) -> Self {
        Self::new(
            SelectionStrategy::for_policy(settings.platform(platform).stop_policy),
            inventory,
        )
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick a registered instance able to run a task needing `spec`.
    ///
    /// The chosen instance loses its idle tag, since it is about to be busy.
    pub async fn instance_for_scheduling(
        &self,
        settings: &ClusterSettings,
        config: &ResolvedInstanceConfig,
        spec: &ContainerSpec,
    ) -> Result<Option<RegisteredInstance>> {
        let now = self.inventory.now();
        let mut candidates: Vec<RegisteredInstance> = self
            .inventory
            .registered_instances(settings)
            .await?
            .into_iter()
            .filter(|r| r.instance.state.is_active())
            .collect();

        match self.strategy {
            SelectionStrategy::OldestInstance => {
                candidates.sort_by_key(|r| Reverse(r.instance.launch_time));
            }
            SelectionStrategy::StopIdleInstance => {
                candidates.sort_by_key(|r| {
                    (
                        r.instance.last_seen_idle().is_some(),
                        idle_elapsed(&r.instance, now),
                    )
                });
            }
        }

        let Some(selected) = candidates.into_iter().find(|r| {
            instance_matches(config, &r.instance) && container_instance_matches(&r.container, spec)
        }) else {
            debug!(platform = %config.platform, "No registered instance fits the task");
            return Ok(None);
        };

        if selected.instance.last_seen_idle().is_some() {
            self.inventory
                .remove_idle_tag(&[selected.id().to_string()])
                .await?;
        }

        debug!(instance_id = %selected.id(), strategy = ?self.strategy, "Selected instance for scheduling");
        Ok(Some(selected))
    }

    /// Idle on-demand instances of `platform` to stop, never dipping below the minimum size
    pub async fn instances_to_stop(
        &self,
        settings: &ClusterSettings,
        platform: Platform,
    ) -> Result<Option<Vec<RegisteredInstance>>> {
        let platform_settings = settings.platform(platform);
        let now = self.inventory.now();

        let active: Vec<RegisteredInstance> = self
            .inventory
            .registered_instances(settings)
            .await?
            .into_iter()
            .filter(|r| {
                !r.instance.is_spot()
                    && r.instance.platform == platform
                    && r.instance.state.is_active()
            })
            .collect();

        if active.len() <= platform_settings.min_instances as usize {
            debug!(
                %platform,
                active = active.len(),
                min = platform_settings.min_instances,
                "At minimum size, nothing to stop"
            );
            return Ok(None);
        }

        let idle: Vec<RegisteredInstance> = active.into_iter().filter(|r| r.is_idle()).collect();
        if idle.is_empty() {
            return Ok(None);
        }

        let selected = match self.strategy {
            SelectionStrategy::OldestInstance => idle
                .into_iter()
                .min_by(|a, b| {
                    a.instance
                        .launch_time
                        .cmp(&b.instance.launch_time)
                        .then_with(|| a.instance.id.cmp(&b.instance.id))
                })
                .into_iter()
                .collect::<Vec<_>>(),
            SelectionStrategy::StopIdleInstance => {
                let threshold = platform_settings.stop_idle_after();
                let mut past: Vec<RegisteredInstance> = idle
                    .into_iter()
                    .filter(|r| idle_longer_than(&r.instance, threshold, now))
                    .collect();
                past.sort_by(|a, b| most_idle_ordering(&a.instance, &b.instance, now));
                past
            }
        };

        if selected.is_empty() {
            Ok(None)
        } else {
            Ok(Some(selected))
        }
    }

    /// Stop what [`instances_to_stop`](Self::instances_to_stop) selects; returns the count
    pub async fn stop_idle_instances(
        &self,
        settings: &ClusterSettings,
        platform: Platform,
    ) -> Result<usize> {
        let Some(instances) = self.instances_to_stop(settings, platform).await? else {
            return Ok(0);
        };

        self.inventory.stop(&instances).await?;
        info!(%platform, count = instances.len(), "Stopped idle instances");
        Ok(instances.len())
    }
}
