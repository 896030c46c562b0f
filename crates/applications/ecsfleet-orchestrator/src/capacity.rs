//! On-demand capacity manager
//!
//! Turns "I need N instances like this" into registered cluster members: restart stopped
//! instances first, create the remainder within the platform ceiling, then wait for the
//! new members to register. All mutating paths of a platform run under that platform's
//! lock so two decisions never race for the same headroom inside one process.

use ecsfleet_core::{
    ComputeInstance, ContainerInstanceRecord, InstanceState, Platform, RegisteredInstance,
    RunInstancesRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{ClusterSettings, ElasticProfile, ResolvedInstanceConfig};
use crate::error::{OrchestratorError, Result};
use crate::idle::{eligible_for_termination, most_idle_ordering};
use crate::inventory::{Inventory, join};
use crate::matcher::instance_matches;
use crate::subnet::SubnetSelector;
use crate::wait::{DEFAULT_RETRY_INTERVAL, Poller};

/// One lock per platform, shared by every component that changes capacity
#[derive(Debug, Default)]
pub struct PlatformLocks {
    locks: [Mutex<()>; 2],
}

impl PlatformLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, platform: Platform) -> MutexGuard<'_, ()> {
        self.locks[platform.index()].lock().await
    }
}

/// Starts, creates and trims on-demand instances
pub struct CapacityManager {
    inventory: Inventory,
    subnets: SubnetSelector,
    locks: Arc<PlatformLocks>,
    retry_interval: Duration,
}

impl CapacityManager {
    pub fn new(inventory: Inventory, locks: Arc<PlatformLocks>) -> Self {
        let subnets = SubnetSelector::new(inventory.compute().clone());
        Self {
            inventory,
            subnets,
            locks,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Set the delay between registration checks
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Make up to `desired` on-demand instances matching `config` available.
    ///
    /// Stopped matching instances are restarted before anything is created. Returns the
    /// instances that registered, which may be fewer than requested when the ceiling
    /// leaves less headroom or some instances never registered.
    pub async fn ensure_instances(
        &self,
        settings: &ClusterSettings,
        config: &ResolvedInstanceConfig,
        desired: u32,
    ) -> Result<Vec<RegisteredInstance>> {
        if config.run_as_spot {
            return Err(OrchestratorError::config(
                "Spot capacity is requested through the spot instance controller",
            ));
        }
        if desired == 0 {
            return Ok(vec![]);
        }

        let _guard = self.locks.lock(config.platform).await;

        let mut ready = self.start_stopped(settings, config, desired).await?;
        let remaining = desired.saturating_sub(ready.len() as u32);
        if remaining == 0 {
            return Ok(ready);
        }

        ready.extend(self.create(settings, config, remaining).await?);
        Ok(ready)
    }

    async fn start_stopped(
        &self,
        settings: &ClusterSettings,
        config: &ResolvedInstanceConfig,
        desired: u32,
    ) -> Result<Vec<RegisteredInstance>> {
        let ids: Vec<String> = self
            .inventory
            .on_demand_instances_for_platform(settings, config.platform)
            .await?
            .into_iter()
            .filter(|i| {
                i.state == InstanceState::Stopped && !i.is_spot() && instance_matches(config, i)
            })
            .take(desired as usize)
            .map(|i| i.id)
            .collect();

        if ids.is_empty() {
            debug!(platform = %config.platform, "No stopped instance to restart");
            return Ok(vec![]);
        }

        self.inventory.remove_idle_tag(&ids).await?;
        self.inventory.compute().start_instances(&ids).await?;
        info!(platform = %config.platform, instances = ?ids, "Starting stopped instances");

        self.wait_for_registration(settings, config, ids).await
    }

    async fn create(
        &self,
        settings: &ClusterSettings,
        config: &ResolvedInstanceConfig,
        remaining: u32,
    ) -> Result<Vec<RegisteredInstance>> {
        let platform = config.platform;
        let max = config.max_instances;
        let now = self.inventory.now();

        let instances = self
            .inventory
            .on_demand_instances_for_platform(settings, platform)
            .await?;
        let mut total = instances.len() as u32;
        let mut stopped: Vec<&ComputeInstance> = instances
            .iter()
            .filter(|i| i.state == InstanceState::Stopped)
            .collect();
        debug!(%platform, total, stopped = stopped.len(), max, "Current on-demand capacity");

        if !stopped.is_empty() && stopped.len() as u32 == max {
            // Every slot is held by a stopped instance unfit for this config: trade one in
            stopped.sort_by(|a, b| most_idle_ordering(a, b, now));
            let victim = stopped[0].id.clone();
            info!(%platform, instance_id = %victim, "Terminating stopped instance to make room");
            self.inventory.terminate(settings, &[victim]).await?;
            total -= 1;
        } else if max <= total {
            return Err(OrchestratorError::CapacityExceeded { platform, max });
        }

        let headroom = max.saturating_sub(total);
        if headroom == 0 {
            return Err(OrchestratorError::CapacityExceeded { platform, max });
        }
        let count = remaining.min(headroom);
        if count < remaining {
            warn!(%platform, requested = remaining, count, "Clamping launch to the remaining headroom");
        }

        let all = self.inventory.all_instances(settings).await?;
        let subnet = self.subnets.select(&config.subnet_ids, &all).await?;

        let request = RunInstancesRequest {
            spec: config.launch_specification(subnet),
            count,
            tags: config.instance_tags(),
        };
        let launched = self.inventory.compute().run_instances(&request).await?;
        let ids: Vec<String> = launched.into_iter().map(|i| i.id).collect();
        info!(%platform, instances = ?ids, "Launched on-demand instances");

        self.wait_for_registration(settings, config, ids).await
    }

    /// Wait for `ids` to register; whatever did not register in time is cleaned up
    async fn wait_for_registration(
        &self,
        settings: &ClusterSettings,
        config: &ResolvedInstanceConfig,
        ids: Vec<String>,
    ) -> Result<Vec<RegisteredInstance>> {
        let inventory = &self.inventory;
        let expected = &ids;

        let outcome = Poller::new(config.registration_timeout)
            .retry_after(self.retry_interval)
            .poll(
                move || async move {
                    let records = inventory.container_instances(settings).await?;
                    Ok::<_, OrchestratorError>(
                        records
                            .into_iter()
                            .filter(|r| r.agent_connected && expected.contains(&r.ec2_instance_id))
                            .collect::<Vec<_>>(),
                    )
                },
                |records: &Vec<ContainerInstanceRecord>| records.len() == expected.len(),
            )
            .await;

        let succeeded = outcome.is_success();
        let records = outcome.into_value().unwrap_or_default();

        if !succeeded {
            let unregistered: Vec<String> = ids
                .iter()
                .filter(|id| !records.iter().any(|r| &r.ec2_instance_id == *id))
                .cloned()
                .collect();
            warn!(
                cluster = %settings.cluster_name,
                instances = ?unregistered,
                timeout = ?config.registration_timeout,
                "Instances did not register in time, terminating them"
            );

            self.inventory
                .deregister_quietly(settings, &unregistered)
                .await;
            self.inventory
                .compute()
                .terminate_instances(&unregistered)
                .await?;

            if records.is_empty() {
                return Err(OrchestratorError::RegistrationTimedOut {
                    cluster: settings.cluster_name.clone(),
                    timeout: config.registration_timeout,
                });
            }
        }

        let instances = self.inventory.instances_for(&records).await?;
        Ok(join(instances, records))
    }

    /// Bring the platform back within its configured minimum and maximum size
    pub async fn ensure_cluster_size(&self, settings: &ClusterSettings, platform: Platform) -> Result<()> {
        let platform_settings = settings.platform(platform);
        if !platform_settings.is_enabled() {
            return Ok(());
        }

        let instances = self
            .inventory
            .on_demand_instances_for_platform(settings, platform)
            .await?;
        let active = instances.iter().filter(|i| i.state.is_active()).count() as u32;
        let total = instances.len() as u32;

        if active < platform_settings.min_instances {
            let shortfall = platform_settings.min_instances - active;
            info!(%platform, active, min = platform_settings.min_instances, "Below minimum size");
            let config = ResolvedInstanceConfig::resolve(settings, &ElasticProfile::empty(platform))?;
            self.ensure_instances(settings, &config, shortfall).await?;
        } else if total > platform_settings.max_instances {
            let _guard = self.locks.lock(platform).await;
            let instances = self
                .inventory
                .on_demand_instances_for_platform(settings, platform)
                .await?;
            let total = instances.len() as u32;
            if total <= platform_settings.max_instances {
                debug!(%platform, total, "Back within maximum size");
                return Ok(());
            }

            info!(%platform, total, max = platform_settings.max_instances, "Above maximum size");
            let now = self.inventory.now();

            let mut registered: Vec<RegisteredInstance> = self
                .inventory
                .registered_instances(settings)
                .await?
                .into_iter()
                .filter(|r| instances.iter().any(|i| i.id == r.instance.id))
                .collect();
            registered.sort_by(|a, b| most_idle_ordering(&a.instance, &b.instance, now));

            if let Some(victim) = registered.into_iter().next() {
                self.inventory.terminate_registered(settings, &[victim]).await?;
            }
        }

        Ok(())
    }

    /// Terminate stopped on-demand instances past their platform's threshold; returns the count
    pub async fn terminate_stopped_instances(&self, settings: &ClusterSettings) -> Result<usize> {
        let now = self.inventory.now();
        let instances = self.inventory.all_on_demand_instances(settings).await?;

        let mut terminated = 0;
        for platform in Platform::ALL {
            let ids: Vec<String> = instances
                .iter()
                .filter(|i| i.platform == platform && eligible_for_termination(i, settings, now))
                .map(|i| i.id.clone())
                .collect();
            if ids.is_empty() {
                continue;
            }

            let _guard = self.locks.lock(platform).await;
            self.inventory.terminate(settings, &ids).await?;
            info!(%platform, count = ids.len(), "Terminated long-stopped instances");
            terminated += ids.len();
        }

        Ok(terminated)
    }
}
