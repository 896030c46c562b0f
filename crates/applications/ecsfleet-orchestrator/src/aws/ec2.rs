//! EC2-backed compute inventory

use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification, Instance,
    InstanceType, RequestSpotLaunchSpecification, ResourceType, Tag, TagSpecification,
    VolumeType,
};
use aws_types::SdkConfig;
use chrono::{DateTime, Utc};
use ecsfleet_core::{
    ApiError, ApiResult, BlockDevice, ComputeApi, ComputeInstance, InstanceFilter, InstanceState,
    Platform, RunInstancesRequest, SpotInstanceRequest, SpotLaunchDetails, SpotRequest,
    SpotRequestFilter, SpotRequestState, Subnet, SubnetState,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{api_error, non_empty};

/// [`ComputeApi`] over the EC2 API
#[derive(Debug, Clone)]
pub struct Ec2Compute {
    client: Client,
}

impl Ec2Compute {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ComputeApi for Ec2Compute {
    async fn describe_instances(&self, filter: &InstanceFilter) -> ApiResult<Vec<ComputeInstance>> {
        let mut filters = tag_filters(&filter.tags);
        if !filter.states.is_empty() {
            filters.push(
                Filter::builder()
                    .name("instance-state-name")
                    .set_values(Some(filter.states.iter().map(|s| s.as_str().to_string()).collect()))
                    .build(),
            );
        }

        let mut instances = Vec::new();
        let mut next_token = None;
        loop {
            let response = self
                .client
                .describe_instances()
                .set_filters(Some(filters.clone()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeInstances", e))?;

            for reservation in response.reservations() {
                instances.extend(reservation.instances().iter().filter_map(to_compute_instance));
            }

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!("Described {} instances", instances.len());
        Ok(instances)
    }

    async fn describe_instances_by_id(&self, ids: &[String]) -> ApiResult<Vec<ComputeInstance>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut instances = Vec::new();
        let mut next_token = None;
        loop {
            let response = self
                .client
                .describe_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeInstances", e))?;

            for reservation in response.reservations() {
                instances.extend(reservation.instances().iter().filter_map(to_compute_instance));
            }

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(instances)
    }

    async fn run_instances(&self, request: &RunInstancesRequest) -> ApiResult<Vec<ComputeInstance>> {
        let spec = &request.spec;
        let count = i32::try_from(request.count).unwrap_or(i32::MAX);
        info!(
            "Launching {} instance(s): type={}, ami={}, subnet={:?}",
            count, spec.instance_type, spec.image_id, spec.subnet_id
        );

        let mut run_req = self
            .client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .set_security_group_ids(non_empty(&spec.security_group_ids))
            .set_key_name(spec.key_name.clone())
            .set_subnet_id(spec.subnet_id.clone())
            .set_user_data(spec.user_data.clone())
            .set_block_device_mappings(block_device_mappings(&spec.block_devices))
            .min_count(count)
            .max_count(count);

        if let Some(profile) = &spec.iam_instance_profile {
            run_req = run_req.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }

        if !request.tags.is_empty() {
            run_req = run_req.tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(to_tags(&request.tags)))
                    .build(),
            );
        }

        let response = run_req
            .send()
            .await
            .map_err(|e| api_error("RunInstances", e))?;

        Ok(response
            .instances()
            .iter()
            .filter_map(to_compute_instance)
            .collect())
    }

    async fn start_instances(&self, ids: &[String]) -> ApiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .start_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("StartInstances", e))?;
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> ApiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("StopInstances", e))?;
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> ApiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("TerminateInstances", e))?;
        info!("Termination initiated for {:?}", ids);
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[(String, String)]) -> ApiResult<()> {
        if resource_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        self.client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(to_tags(tags)))
            .send()
            .await
            .map_err(|e| api_error("CreateTags", e))?;
        Ok(())
    }

    async fn delete_tags(&self, resource_ids: &[String], keys: &[&str]) -> ApiResult<()> {
        if resource_ids.is_empty() || keys.is_empty() {
            return Ok(());
        }
        self.client
            .delete_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(keys.iter().map(|k| Tag::builder().key(*k).build()).collect()))
            .send()
            .await
            .map_err(|e| api_error("DeleteTags", e))?;
        Ok(())
    }

    async fn request_spot_instance(&self, request: &SpotInstanceRequest) -> ApiResult<SpotRequest> {
        let spec = &request.spec;

        let mut launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .set_security_group_ids(non_empty(&spec.security_group_ids))
            .set_key_name(spec.key_name.clone())
            .set_subnet_id(spec.subnet_id.clone())
            .set_user_data(spec.user_data.clone())
            .set_block_device_mappings(block_device_mappings(&spec.block_devices));
        if let Some(profile) = &spec.iam_instance_profile {
            launch = launch.iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(profile)
                    .build(),
            );
        }

        let response = self
            .client
            .request_spot_instances()
            .instance_count(1)
            .set_spot_price(request.spot_price.clone())
            .set_valid_until(
                request
                    .valid_until
                    .map(|t| aws_sdk_ec2::primitives::DateTime::from_secs(t.timestamp())),
            )
            .launch_specification(launch.build())
            .send()
            .await
            .map_err(|e| api_error("RequestSpotInstances", e))?;

        response
            .spot_instance_requests()
            .iter()
            .find_map(to_spot_request)
            .ok_or_else(|| {
                ApiError::service("RequestSpotInstances", "No spot instance request in response")
            })
    }

    async fn describe_spot_requests(&self, filter: &SpotRequestFilter) -> ApiResult<Vec<SpotRequest>> {
        let mut filters = tag_filters(&filter.tags);
        if !filter.states.is_empty() {
            filters.push(
                Filter::builder()
                    .name("state")
                    .set_values(Some(filter.states.iter().map(|s| s.as_str().to_string()).collect()))
                    .build(),
            );
        }

        let mut requests = Vec::new();
        let mut next_token = None;
        loop {
            let response = self
                .client
                .describe_spot_instance_requests()
                .set_filters(Some(filters.clone()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| api_error("DescribeSpotInstanceRequests", e))?;

            requests.extend(response.spot_instance_requests().iter().filter_map(to_spot_request));

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(requests)
    }

    async fn describe_spot_requests_by_id(&self, ids: &[String]) -> ApiResult<Vec<SpotRequest>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let response = self
            .client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("DescribeSpotInstanceRequests", e))?;

        Ok(response
            .spot_instance_requests()
            .iter()
            .filter_map(to_spot_request)
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> ApiResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("CancelSpotInstanceRequests", e))?;
        Ok(())
    }

    async fn describe_subnets(&self, ids: &[String]) -> ApiResult<Vec<Subnet>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let response = self
            .client
            .describe_subnets()
            .set_subnet_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("DescribeSubnets", e))?;

        Ok(response
            .subnets()
            .iter()
            .filter_map(|s| {
                Some(Subnet {
                    id: s.subnet_id()?.to_string(),
                    state: s
                        .state()
                        .map(|state| SubnetState::from_name(state.as_str()))
                        .unwrap_or(SubnetState::Unavailable),
                })
            })
            .collect())
    }
}

fn tag_filters(tags: &[(String, String)]) -> Vec<Filter> {
    tags.iter()
        .map(|(key, value)| {
            Filter::builder()
                .name(format!("tag:{}", key))
                .values(value)
                .build()
        })
        .collect()
}

fn to_tags(tags: &[(String, String)]) -> Vec<Tag> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect()
}

fn from_tags(tags: &[Tag]) -> HashMap<String, String> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

fn block_device_mappings(devices: &[BlockDevice]) -> Option<Vec<BlockDeviceMapping>> {
    if devices.is_empty() {
        return None;
    }

    Some(
        devices
            .iter()
            .map(|device| {
                BlockDeviceMapping::builder()
                    .device_name(&device.device_name)
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(device.size_gb)
                            .volume_type(VolumeType::from(device.volume_type.as_str()))
                            .set_iops(device.iops)
                            .delete_on_termination(device.delete_on_termination)
                            .build(),
                    )
                    .build()
            })
            .collect(),
    )
}

fn to_compute_instance(instance: &Instance) -> Option<ComputeInstance> {
    let Some(id) = instance.instance_id() else {
        warn!("Skipping instance without an id");
        return None;
    };

    let launch_time = instance
        .launch_time()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_default();

    Some(ComputeInstance {
        id: id.to_string(),
        platform: Platform::from_ec2_platform(instance.platform().map(|p| p.as_str())),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|name| InstanceState::from_name(name.as_str()))
            .unwrap_or(InstanceState::Unknown),
        image_id: instance.image_id().unwrap_or_default().to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        subnet_id: instance.subnet_id().map(str::to_string),
        security_group_ids: instance
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect(),
        tags: from_tags(instance.tags()),
        spot_request_id: instance.spot_instance_request_id().map(str::to_string),
        launch_time,
    })
}

fn to_spot_request(request: &aws_sdk_ec2::types::SpotInstanceRequest) -> Option<SpotRequest> {
    let id = request.spot_instance_request_id()?;
    let launch = request
        .launch_specification()
        .map(|spec| SpotLaunchDetails {
            image_id: spec.image_id().unwrap_or_default().to_string(),
            instance_type: spec
                .instance_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            subnet_id: spec.subnet_id().map(str::to_string),
            security_group_ids: spec
                .security_groups()
                .iter()
                .filter_map(|g| g.group_id().map(str::to_string))
                .collect(),
        })
        .unwrap_or_default();

    Some(SpotRequest {
        id: id.to_string(),
        state: request
            .state()
            .map(|s| SpotRequestState::from_name(s.as_str()))
            .unwrap_or(SpotRequestState::Unknown),
        status_code: request.status().and_then(|s| s.code()).map(str::to_string),
        instance_id: request.instance_id().map(str::to_string),
        launch,
        tags: from_tags(request.tags()),
    })
}
