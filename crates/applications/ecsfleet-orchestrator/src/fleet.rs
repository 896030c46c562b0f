//! Wiring of the orchestrator components around one set of cloud clients

use ecsfleet_core::{ComputeApi, ContainerClusterApi};
use std::sync::Arc;

use crate::capacity::{CapacityManager, PlatformLocks};
use crate::clock::Clock;
use crate::heartbeat::Heartbeat;
use crate::inventory::Inventory;
use crate::scheduler::TaskScheduler;
use crate::spot::SpotInstanceController;

/// Every component, sharing one inventory and one set of platform locks
pub struct Fleet {
    pub inventory: Inventory,
    pub capacity: Arc<CapacityManager>,
    pub spot: Arc<SpotInstanceController>,
    pub scheduler: TaskScheduler,
    pub heartbeat: Heartbeat,
}

impl Fleet {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        cluster: Arc<dyn ContainerClusterApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inventory = Inventory::new(compute, cluster, clock);
        let locks = Arc::new(PlatformLocks::new());
        let capacity = Arc::new(CapacityManager::new(inventory.clone(), locks.clone()));
        let spot = Arc::new(SpotInstanceController::new(inventory.clone(), locks));

        Self {
            scheduler: TaskScheduler::new(inventory.clone(), capacity.clone(), spot.clone()),
            heartbeat: Heartbeat::new(inventory.clone(), capacity.clone(), spot.clone()),
            inventory,
            capacity,
            spot,
        }
    }
}
