//! Core types shared across ecsfleet components

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::tags;

/// Operating system family a cluster instance serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Linux, Platform::Windows];

    /// Wire name used in tags and instance names
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "LINUX",
            Platform::Windows => "WINDOWS",
        }
    }

    /// Dense index, for per-platform registries
    pub fn index(&self) -> usize {
        match self {
            Platform::Linux => 0,
            Platform::Windows => 1,
        }
    }

    /// EC2 reports `windows` for Windows instances and nothing for everything else
    pub fn from_ec2_platform(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("windows") => Platform::Windows,
            _ => Platform::Linux,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LINUX" => Ok(Platform::Linux),
            "WINDOWS" => Ok(Platform::Windows),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// Compute instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
            InstanceState::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "terminated" => InstanceState::Terminated,
            _ => InstanceState::Unknown,
        }
    }

    /// Pending or running
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a compute instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub id: String,
    pub platform: Platform,
    pub state: InstanceState,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub tags: HashMap<String, String>,
    /// Present only on spot instances
    pub spot_request_id: Option<String>,
    pub launch_time: DateTime<Utc>,
}

impl ComputeInstance {
    pub fn is_spot(&self) -> bool {
        self.spot_request_id.is_some()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.tag(tags::NAME)
    }

    /// When the instance was last observed without tasks
    pub fn last_seen_idle(&self) -> Option<DateTime<Utc>> {
        self.tag(tags::LAST_SEEN_IDLE).and_then(parse_millis)
    }

    /// When the instance was stopped for being idle
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.tag(tags::STOPPED_AT).and_then(parse_millis)
    }
}

/// Timestamp tag value (epoch milliseconds)
pub fn millis_tag_value(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn parse_millis(value: &str) -> Option<DateTime<Utc>> {
    let millis = value.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// CPU units and memory (MiB)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: i64,
    pub memory: i64,
}

/// Registration of a compute instance with the container cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInstanceRecord {
    pub arn: String,
    pub ec2_instance_id: String,
    pub agent_connected: bool,
    /// `ACTIVE`, `DRAINING`, `INACTIVE`, ...
    pub status: String,
    pub running_tasks: u32,
    pub pending_tasks: u32,
    pub remaining: Resources,
    pub registered: Resources,
}

impl ContainerInstanceRecord {
    pub const ACTIVE: &'static str = "ACTIVE";
    pub const INACTIVE: &'static str = "INACTIVE";

    /// No running and no pending tasks
    pub fn is_idle(&self) -> bool {
        self.running_tasks == 0 && self.pending_tasks == 0
    }

    pub fn is_inactive(&self) -> bool {
        self.status.eq_ignore_ascii_case(Self::INACTIVE)
    }
}

/// A compute instance that is a schedulable member of the container cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredInstance {
    pub instance: ComputeInstance,
    pub container: ContainerInstanceRecord,
}

impl RegisteredInstance {
    pub fn new(instance: ComputeInstance, container: ContainerInstanceRecord) -> Self {
        Self { instance, container }
    }

    pub fn id(&self) -> &str {
        &self.instance.id
    }

    pub fn is_idle(&self) -> bool {
        self.container.is_idle()
    }
}

/// Spot request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
    Unknown,
}

impl SpotRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotRequestState::Open => "open",
            SpotRequestState::Active => "active",
            SpotRequestState::Closed => "closed",
            SpotRequestState::Cancelled => "cancelled",
            SpotRequestState::Failed => "failed",
            SpotRequestState::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "open" => SpotRequestState::Open,
            "active" => SpotRequestState::Active,
            "closed" => SpotRequestState::Closed,
            "cancelled" => SpotRequestState::Cancelled,
            "failed" => SpotRequestState::Failed,
            _ => SpotRequestState::Unknown,
        }
    }
}

/// Launch parameters echoed back on a spot request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotLaunchDetails {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
}

/// Snapshot of a spot-market request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRequest {
    pub id: String,
    pub state: SpotRequestState,
    pub status_code: Option<String>,
    pub instance_id: Option<String>,
    pub launch: SpotLaunchDetails,
    pub tags: HashMap<String, String>,
}

impl SpotRequest {
    /// Status code of a cancelled request whose instance still runs
    pub const CANCELED_AND_INSTANCE_RUNNING: &'static str = "request-canceled-and-instance-running";

    /// Platform from the request's tag, if tagged yet
    pub fn platform(&self) -> Option<Platform> {
        self.tags.get(tags::PLATFORM).and_then(|p| p.parse().ok())
    }

    pub fn is_open_or_active(&self) -> bool {
        matches!(self.state, SpotRequestState::Open | SpotRequestState::Active)
    }

    pub fn is_cancelled_with_running_instance(&self) -> bool {
        self.state == SpotRequestState::Cancelled
            && self.status_code.as_deref() == Some(Self::CANCELED_AND_INSTANCE_RUNNING)
    }

    /// Still backs (or will back) an instance
    pub fn is_live(&self) -> bool {
        self.is_open_or_active() || self.is_cancelled_with_running_instance()
    }
}

/// EBS volume attached at launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub device_name: String,
    pub volume_type: String,
    pub size_gb: i32,
    pub iops: Option<i32>,
    pub delete_on_termination: bool,
}

/// Launch parameters shared by on-demand and spot launches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpecification {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    /// Base64-encoded boot payload
    pub user_data: Option<String>,
    pub block_devices: Vec<BlockDevice>,
}

/// On-demand launch of `count` identical instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInstancesRequest {
    pub spec: LaunchSpecification,
    pub count: u32,
    pub tags: Vec<(String, String)>,
}

/// One-instance spot-market request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotInstanceRequest {
    pub spec: LaunchSpecification,
    pub spot_price: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Subnet availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetState {
    Available,
    Pending,
    Unavailable,
}

impl SubnetState {
    pub fn from_name(name: &str) -> Self {
        match name {
            "available" => SubnetState::Available,
            "pending" => SubnetState::Pending,
            _ => SubnetState::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub state: SubnetState,
}

/// Instance listing filter; every clause must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub tags: Vec<(String, String)>,
    pub states: Vec<InstanceState>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_states(mut self, states: &[InstanceState]) -> Self {
        self.states.extend_from_slice(states);
        self
    }

    /// Client-side evaluation, mirroring what the provider does server-side
    pub fn matches(&self, instance: &ComputeInstance) -> bool {
        (self.states.is_empty() || self.states.contains(&instance.state))
            && self
                .tags
                .iter()
                .all(|(k, v)| instance.tag(k) == Some(v.as_str()))
    }
}

/// Spot request listing filter; every clause must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotRequestFilter {
    pub tags: Vec<(String, String)>,
    pub states: Vec<SpotRequestState>,
}

impl SpotRequestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_states(mut self, states: &[SpotRequestState]) -> Self {
        self.states.extend_from_slice(states);
        self
    }

    pub fn matches(&self, request: &SpotRequest) -> bool {
        (self.states.is_empty() || self.states.contains(&request.state))
            && self
                .tags
                .iter()
                .all(|(k, v)| request.tags.get(k) == Some(v))
    }
}

/// Container cluster summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub arn: String,
    pub status: String,
    pub registered_instances: u32,
}
