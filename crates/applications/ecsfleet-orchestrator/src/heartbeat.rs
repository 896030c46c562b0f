//! Periodic fleet maintenance
//!
//! One heartbeat tags fresh spot instances, reclaims idle capacity and keeps every
//! platform within its configured size. Each step is independent: a failing step is
//! logged and the next one still runs.

use ecsfleet_core::Platform;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::capacity::CapacityManager;
use crate::config::ClusterSettings;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::spot::SpotInstanceController;
use crate::strategy::InstanceSelector;

/// Steps of one heartbeat that failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub failed_steps: Vec<String>,
}

impl HeartbeatReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }

    fn record<T>(&mut self, step: &str, result: Result<T>) {
        match result {
            Ok(_) => debug!(step, "Heartbeat step done"),
            Err(e) => {
                error!(step, error = %e, "Heartbeat step failed");
                self.failed_steps.push(step.to_string());
            }
        }
    }
}

pub struct Heartbeat {
    inventory: Inventory,
    capacity: Arc<CapacityManager>,
    spot: Arc<SpotInstanceController>,
}

impl Heartbeat {
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

    /// Run every maintenance step once
    pub async fn run_once(&self, settings: &ClusterSettings) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        report.record("tag_spot_instances", self.spot.tag_spot_instances(settings).await);
        report.record(
            "tag_idle_spot_instances",
            self.spot.tag_idle_spot_instances(settings).await,
        );
        report.record(
            "refresh_untagged_spot_requests",
            self.spot.refresh_untagged_spot_requests(settings).await,
        );
        report.record(
            "terminate_idle_spot_instances",
            self.spot.terminate_idle_spot_instances(settings).await,
        );

        for platform in Platform::ALL {
            report.record(
                &format!("ensure_cluster_size[{}]", platform),
                self.capacity.ensure_cluster_size(settings, platform).await,
            );
        }

        for platform in Platform::ALL {
            if !settings.platform(platform).is_enabled() {
                continue;
            }
            let selector = InstanceSelector::for_platform(settings, platform, self.inventory.clone());
            report.record(
                &format!("stop_idle_instances[{}]", platform),
                selector.stop_idle_instances(settings, platform).await,
            );
        }

        report.record(
            "terminate_stopped_instances",
            self.capacity.terminate_stopped_instances(settings).await,
        );

        report
    }

    /// Run a heartbeat every `period` until `shutdown` resolves
    pub async fn run<F>(&self, settings: &ClusterSettings, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(cluster = %settings.cluster_name, ?period, "Heartbeat started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Heartbeat stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_once(settings).await;
                    if !report.is_clean() {
                        info!(failed = ?report.failed_steps, "Heartbeat finished with failures");
                    }
                }
            }
        }
    }
}
