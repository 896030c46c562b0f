//! Cluster settings and per-decision instance configuration
//!
//! `ClusterSettings` is the cluster-wide document loaded from JSON. A job's
//! [`ElasticProfile`] is merged over it into a [`ResolvedInstanceConfig`] for every
//! scheduling decision; profile values win when present.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Duration as ChronoDuration;
use ecsfleet_core::{BlockDevice, LaunchSpecification, Platform, tags};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

const LINUX_OS_DEVICE_NAME: &str = "/dev/xvda";
const WINDOWS_OS_DEVICE_NAME: &str = "/dev/sda1";
const LINUX_DOCKER_DEVICE_NAME: &str = "/dev/xvdcz";

/// How idle on-demand capacity is picked for reclamation (and ordered for scheduling)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StopPolicy {
    /// Schedule on the newest instance, stop the oldest idle one
    StopOldestInstance,

    /// Schedule on the least idle instance, stop everything idle past the threshold
    #[default]
    StopIdleInstance,
}

impl FromStr for StopPolicy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "StopOldestInstance" => Ok(Self::StopOldestInstance),
            "StopIdleInstance" => Ok(Self::StopIdleInstance),
            other => Err(OrchestratorError::config(format!(
                "No strategy available for stop policy {}",
                other
            ))),
        }
    }
}

/// EBS volume settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// `gp3`, `io1`, ... or `none` to skip the volume
    pub volume_type: String,
    pub size_gb: i32,
    #[serde(default)]
    pub iops: Option<i32>,
}

impl VolumeSpec {
    fn block_device(&self, device_name: &str) -> Option<BlockDevice> {
        if self.volume_type.is_empty() || self.volume_type == "none" {
            return None;
        }

        // Provisioned IOPS only apply to io volumes
        let iops = if self.volume_type.starts_with("io") {
            self.iops
        } else {
            None
        };

        Some(BlockDevice {
            device_name: device_name.to_string(),
            volume_type: self.volume_type.clone(),
            size_gb: self.size_gb,
            iops,
            delete_on_termination: true,
        })
    }
}

/// Settings for one platform's slice of the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSettings {
    #[serde(default)]
    pub ami: Option<String>,

    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub os_volume: Option<VolumeSpec>,

    /// Extra docker volume (Linux only)
    #[serde(default)]
    pub docker_volume: Option<VolumeSpec>,

    /// How long a launched or started instance has to register with the cluster
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,

    #[serde(default)]
    pub min_instances: u32,

    #[serde(default)]
    pub max_instances: u32,

    #[serde(default)]
    pub max_spot_instances: u32,

    #[serde(default)]
    pub stop_policy: StopPolicy,

    #[serde(default = "default_stop_after_minutes")]
    pub stop_idle_after_minutes: u64,

    #[serde(default = "default_terminate_stopped_after_minutes")]
    pub terminate_stopped_after_minutes: u64,

    #[serde(default = "default_terminate_idle_spot_after_minutes")]
    pub terminate_idle_spot_after_minutes: u64,

    /// Boot script, sent base64-encoded
    #[serde(default)]
    pub user_data: Option<String>,
}

fn default_registration_timeout_secs() -> u64 {
    300
}

fn default_stop_after_minutes() -> u64 {
    10
}

fn default_terminate_stopped_after_minutes() -> u64 {
    24 * 60
}

fn default_terminate_idle_spot_after_minutes() -> u64 {
    10
}

fn default_spot_request_expiry_minutes() -> u64 {
    5
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            ami: None,
            instance_type: None,
            os_volume: None,
            docker_volume: None,
            registration_timeout_secs: default_registration_timeout_secs(),
            min_instances: 0,
            max_instances: 0,
            max_spot_instances: 0,
            stop_policy: StopPolicy::default(),
            stop_idle_after_minutes: default_stop_after_minutes(),
            terminate_stopped_after_minutes: default_terminate_stopped_after_minutes(),
            terminate_idle_spot_after_minutes: default_terminate_idle_spot_after_minutes(),
            user_data: None,
        }
    }
}

impl PlatformSettings {
    /// A platform is in use once any capacity is allowed on it
    pub fn is_enabled(&self) -> bool {
        self.max_instances > 0 || self.max_spot_instances > 0 || self.min_instances > 0
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn stop_idle_after(&self) -> ChronoDuration {
        minutes(self.stop_idle_after_minutes)
    }

    pub fn terminate_stopped_after(&self) -> ChronoDuration {
        minutes(self.terminate_stopped_after_minutes)
    }

    pub fn terminate_idle_spot_after(&self) -> ChronoDuration {
        minutes(self.terminate_idle_spot_after_minutes)
    }
}

fn minutes(value: u64) -> ChronoDuration {
    i64::try_from(value)
        .ok()
        .and_then(ChronoDuration::try_minutes)
        .unwrap_or(ChronoDuration::MAX)
}

/// Cluster-wide settings document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// ECS cluster name
    pub cluster_name: String,

    /// Identity of this orchestrator process, stamped as `server-id` on what it creates
    #[serde(default)]
    pub server_id: String,

    #[serde(default)]
    pub security_group_ids: Vec<String>,

    #[serde(default)]
    pub subnet_ids: Vec<String>,

    #[serde(default)]
    pub iam_instance_profile: Option<String>,

    #[serde(default)]
    pub key_pair: Option<String>,

    #[serde(default = "default_spot_request_expiry_minutes")]
    pub spot_request_expiry_minutes: u64,

    #[serde(default)]
    pub linux: PlatformSettings,

    #[serde(default)]
    pub windows: PlatformSettings,
}

impl ClusterSettings {
    /// Create settings for a cluster with both platforms disabled
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            server_id: String::new(),
            security_group_ids: vec![],
            subnet_ids: vec![],
            iam_instance_profile: None,
            key_pair: None,
            spot_request_expiry_minutes: default_spot_request_expiry_minutes(),
            linux: PlatformSettings::default(),
            windows: PlatformSettings::default(),
        }
    }

    /// Parse settings from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Set the server id
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Settings of one platform
    pub fn platform(&self, platform: Platform) -> &PlatformSettings {
        match platform {
            Platform::Linux => &self.linux,
            Platform::Windows => &self.windows,
        }
    }

    pub fn platform_mut(&mut self, platform: Platform) -> &mut PlatformSettings {
        match platform {
            Platform::Linux => &mut self.linux,
            Platform::Windows => &mut self.windows,
        }
    }

    /// Check the document for inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(OrchestratorError::config("cluster_name must not be empty"));
        }
        if self.server_id.trim().is_empty() {
            return Err(OrchestratorError::config("server_id must not be empty"));
        }

        for platform in Platform::ALL {
            let settings = self.platform(platform);
            if !settings.is_enabled() {
                continue;
            }
            if settings.ami.as_deref().is_none_or(str::is_empty) {
                return Err(OrchestratorError::config(format!(
                    "{} AMI must be set when {} capacity is enabled",
                    platform, platform
                )));
            }
            if settings.instance_type.as_deref().is_none_or(str::is_empty) {
                return Err(OrchestratorError::config(format!(
                    "{} instance type must be set when {} capacity is enabled",
                    platform, platform
                )));
            }
            if settings.min_instances > settings.max_instances {
                return Err(OrchestratorError::config(format!(
                    "{} min_instances ({}) exceeds max_instances ({})",
                    platform, settings.min_instances, settings.max_instances
                )));
            }
            if settings.registration_timeout_secs == 0 {
                return Err(OrchestratorError::config(format!(
                    "{} registration timeout must be positive",
                    platform
                )));
            }
        }

        Ok(())
    }
}

/// Job-level launch overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticProfile {
    pub platform: Option<Platform>,

    #[serde(default)]
    pub ami: Option<String>,

    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub security_group_ids: Vec<String>,

    #[serde(default)]
    pub subnet_ids: Vec<String>,

    #[serde(default)]
    pub iam_instance_profile: Option<String>,

    #[serde(default)]
    pub run_as_spot: bool,

    #[serde(default)]
    pub spot_price: Option<String>,

    #[serde(default)]
    pub spot_request_expiry_minutes: Option<u64>,
}

impl ElasticProfile {
    /// Profile without overrides, used to maintain the platform's minimum size
    pub fn empty(platform: Platform) -> Self {
        Self {
            platform: Some(platform),
            ..Default::default()
        }
    }

    /// Run on spot capacity
    pub fn spot(mut self, price: Option<String>) -> Self {
        self.run_as_spot = true;
        self.spot_price = price;
        self
    }

    pub fn with_ami(mut self, ami: impl Into<String>) -> Self {
        self.ami = Some(ami.into());
        self
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = Some(instance_type.into());
        self
    }

    pub fn with_security_group(mut self, id: impl Into<String>) -> Self {
        self.security_group_ids.push(id.into());
        self
    }

    pub fn with_subnet(mut self, id: impl Into<String>) -> Self {
        self.subnet_ids.push(id.into());
        self
    }

    /// Profiles default to Linux
    pub fn platform(&self) -> Platform {
        self.platform.unwrap_or(Platform::Linux)
    }
}

/// Resources a task needs on its container instance; `None` means no requirement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub cpu: Option<i64>,
    pub memory: Option<i64>,
}

impl ContainerSpec {
    pub fn new(cpu: Option<i64>, memory: Option<i64>) -> Self {
        Self { cpu, memory }
    }
}

/// Immutable launch configuration for one scheduling decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInstanceConfig {
    pub platform: Platform,
    pub ami: String,
    pub instance_type: String,
    pub security_group_ids: Vec<String>,
    pub iam_instance_profile: Option<String>,
    pub key_pair: Option<String>,
    pub subnet_ids: Vec<String>,
    /// Base64-encoded boot payload
    pub user_data: Option<String>,
    pub os_volume: Option<VolumeSpec>,
    pub docker_volume: Option<VolumeSpec>,
    pub tags: Vec<(String, String)>,
    pub server_id: String,
    pub registration_timeout: Duration,
    pub max_instances: u32,
    pub min_instances: u32,
    pub max_spot_instances: u32,
    pub run_as_spot: bool,
    pub spot_price: Option<String>,
    pub spot_request_expiry: ChronoDuration,
}

impl ResolvedInstanceConfig {
    /// Merge a profile over the cluster settings
    pub fn resolve(settings: &ClusterSettings, profile: &ElasticProfile) -> Result<Self> {
        let platform = profile.platform();
        let platform_settings = settings.platform(platform);

        let ami = non_empty(profile.ami.as_deref())
            .or(non_empty(platform_settings.ami.as_deref()))
            .ok_or_else(|| {
                OrchestratorError::config(format!("No AMI configured for platform {}", platform))
            })?
            .to_string();

        let instance_type = non_empty(profile.instance_type.as_deref())
            .or(non_empty(platform_settings.instance_type.as_deref()))
            .ok_or_else(|| {
                OrchestratorError::config(format!(
                    "No instance type configured for platform {}",
                    platform
                ))
            })?
            .to_string();

        let security_group_ids = dedup(if profile.security_group_ids.is_empty() {
            &settings.security_group_ids
        } else {
            &profile.security_group_ids
        });

        let subnet_ids = dedup(if profile.subnet_ids.is_empty() {
            &settings.subnet_ids
        } else {
            &profile.subnet_ids
        });

        let iam_instance_profile = non_empty(profile.iam_instance_profile.as_deref())
            .or(non_empty(settings.iam_instance_profile.as_deref()))
            .map(str::to_string);

        let user_data = platform_settings
            .user_data
            .as_deref()
            .filter(|script| !script.is_empty())
            .map(|script| BASE64.encode(script));

        let name = if profile.run_as_spot {
            tags::spot_instance_name(&settings.cluster_name, platform)
        } else {
            tags::on_demand_instance_name(&settings.cluster_name, platform)
        };

        let config_tags = vec![
            (tags::NAME.to_string(), name),
            (tags::CREATOR.to_string(), tags::CREATOR_ID.to_string()),
            (tags::CLUSTER_NAME.to_string(), settings.cluster_name.clone()),
            (tags::PLATFORM.to_string(), platform.to_string()),
        ];

        let expiry_minutes = profile
            .spot_request_expiry_minutes
            .unwrap_or(settings.spot_request_expiry_minutes);

        Ok(Self {
            platform,
            ami,
            instance_type,
            security_group_ids,
            iam_instance_profile,
            key_pair: settings.key_pair.clone(),
            subnet_ids,
            user_data,
            os_volume: platform_settings.os_volume.clone(),
            docker_volume: platform_settings.docker_volume.clone(),
            tags: config_tags,
            server_id: settings.server_id.clone(),
            registration_timeout: platform_settings.registration_timeout(),
            max_instances: platform_settings.max_instances,
            min_instances: platform_settings.min_instances,
            max_spot_instances: platform_settings.max_spot_instances,
            run_as_spot: profile.run_as_spot,
            spot_price: profile.spot_price.clone(),
            spot_request_expiry: minutes(expiry_minutes),
        })
    }

    /// Tags for launched instances: the config tag set plus `server-id`
    pub fn instance_tags(&self) -> Vec<(String, String)> {
        let mut all = self.tags.clone();
        all.push((tags::SERVER_ID.to_string(), self.server_id.clone()));
        all
    }

    /// Launch parameters, placed in `subnet_id` when given
    pub fn launch_specification(&self, subnet_id: Option<String>) -> LaunchSpecification {
        let mut block_devices = Vec::new();

        let os_device = match self.platform {
            Platform::Linux => LINUX_OS_DEVICE_NAME,
            Platform::Windows => WINDOWS_OS_DEVICE_NAME,
        };
        if let Some(device) = self.os_volume.as_ref().and_then(|v| v.block_device(os_device)) {
            block_devices.push(device);
        }

        // Windows keeps docker data on the root volume
        if self.platform == Platform::Linux {
            if let Some(device) = self
                .docker_volume
                .as_ref()
                .and_then(|v| v.block_device(LINUX_DOCKER_DEVICE_NAME))
            {
                block_devices.push(device);
            }
        }

        LaunchSpecification {
            image_id: self.ami.clone(),
            instance_type: self.instance_type.clone(),
            key_name: self.key_pair.clone(),
            iam_instance_profile: self.iam_instance_profile.clone(),
            security_group_ids: self.security_group_ids.clone(),
            subnet_id,
            user_data: self.user_data.clone(),
            block_devices,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !value.is_empty() && !out.contains(value) {
            out.push(value.clone());
        }
    }
    out
}
