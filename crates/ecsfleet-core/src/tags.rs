//! Tag keys shared by every process acting on the same cluster
//!
//! The external inventory's tags are the only durable state the fleet owns; they double
//! as the coordination format between orchestrators.

use crate::types::Platform;

/// Instance / spot request name
pub const NAME: &str = "Name";

/// Identity of the tool that created the resource
pub const CREATOR: &str = "Creator";

/// Owning cluster
pub const CLUSTER_NAME: &str = "cluster-name";

/// Platform the resource serves (`LINUX` / `WINDOWS`)
pub const PLATFORM: &str = "platform";

/// Identity of the orchestrator process that created the resource
pub const SERVER_ID: &str = "server-id";

/// Epoch milliseconds when the instance was last observed without tasks
pub const LAST_SEEN_IDLE: &str = "last-seen-idle";

/// Epoch milliseconds when the instance was stopped for being idle
pub const STOPPED_AT: &str = "stopped-at";

/// Value of the `Creator` tag on everything this tool launches
pub const CREATOR_ID: &str = "ecsfleet";

/// Name of on-demand instances of a cluster and platform
pub fn on_demand_instance_name(cluster_name: &str, platform: Platform) -> String {
    format!("{}_{}_INSTANCE", cluster_name, platform)
}

/// Name of spot instances of a cluster and platform
pub fn spot_instance_name(cluster_name: &str, platform: Platform) -> String {
    format!("{}_{}_SPOT_INSTANCE", cluster_name, platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_names() {
        assert_eq!(
            on_demand_instance_name("build", Platform::Linux),
            "build_LINUX_INSTANCE"
        );
        assert_eq!(
            spot_instance_name("build", Platform::Windows),
            "build_WINDOWS_SPOT_INSTANCE"
        );
    }
}
