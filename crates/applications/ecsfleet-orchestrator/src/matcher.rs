//! Compatibility checks between a launch configuration and existing capacity

use ecsfleet_core::{ComputeInstance, ContainerInstanceRecord, SpotRequest};

use crate::config::{ContainerSpec, ResolvedInstanceConfig};

/// Can `instance` serve a job launched with `config`?
///
/// Subnet and security group constraints only apply when the config names any.
pub fn instance_matches(config: &ResolvedInstanceConfig, instance: &ComputeInstance) -> bool {
    instance.platform == config.platform
        && instance.image_id == config.ami
        && instance.instance_type == config.instance_type
        && subnet_allowed(&config.subnet_ids, instance.subnet_id.as_deref())
        && groups_covered(&config.security_group_ids, &instance.security_group_ids)
        && instance.is_spot() == config.run_as_spot
}

/// Does the registration have room for the task? Unset requirements always fit.
pub fn container_instance_matches(record: &ContainerInstanceRecord, spec: &ContainerSpec) -> bool {
    if !record.agent_connected || record.is_inactive() {
        return false;
    }

    let fits = |required: Option<i64>, remaining: i64| required.is_none_or(|r| r < remaining);
    fits(spec.cpu, record.remaining.cpu) && fits(spec.memory, record.remaining.memory)
}

/// Will the pending spot request produce an instance usable by `config`?
pub fn spot_request_matches(config: &ResolvedInstanceConfig, request: &SpotRequest) -> bool {
    config.run_as_spot
        && request.platform() == Some(config.platform)
        && request.launch.image_id == config.ami
        && request.launch.instance_type == config.instance_type
        && subnet_allowed(&config.subnet_ids, request.launch.subnet_id.as_deref())
        && groups_covered(&config.security_group_ids, &request.launch.security_group_ids)
}

fn subnet_allowed(allowed: &[String], subnet: Option<&str>) -> bool {
    allowed.is_empty() || subnet.is_some_and(|s| allowed.iter().any(|a| a == s))
}

fn groups_covered(required: &[String], actual: &[String]) -> bool {
    required.iter().all(|g| actual.contains(g))
}
