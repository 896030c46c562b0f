//! In-memory fakes of the cloud APIs for unit tests
//!
//! [`FakeCompute`] and [`FakeCluster`] share a call journal so tests can assert on the
//! order of mutating calls. Launched and started instances register with the fake
//! cluster on the spot, agent connected unless told otherwise.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ecsfleet_core::{
    ApiError, ApiResult, ClusterInfo, ComputeApi, ComputeInstance, ContainerClusterApi,
    ContainerInstanceRecord, InstanceFilter, InstanceState, Platform, Resources,
    RunInstancesRequest, SpotInstanceRequest, SpotLaunchDetails, SpotRequest, SpotRequestFilter,
    SpotRequestState, Subnet, millis_tag_value, tags,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::ClusterSettings;
use crate::inventory::Inventory;

pub const CLUSTER: &str = "build";
pub const SERVER_ID: &str = "server-1";

/// Start of every test timeline
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Linux enabled with two on-demand and two spot instances, Windows disabled
pub fn test_settings() -> ClusterSettings {
    let mut settings = ClusterSettings::new(CLUSTER).with_server_id(SERVER_ID);
    settings.security_group_ids = vec!["sg-1".to_string()];
    settings.linux.ami = Some("ami-linux".to_string());
    settings.linux.instance_type = Some("t3.large".to_string());
    settings.linux.max_instances = 2;
    settings.linux.max_spot_instances = 2;
    settings
}

/// Mutating call recorded by the fakes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RunInstances { count: u32 },
    Start(Vec<String>),
    Stop(Vec<String>),
    Terminate(Vec<String>),
    CreateTags(Vec<String>),
    DeleteTags(Vec<String>),
    RequestSpot,
    CancelSpot(Vec<String>),
    Deregister(String),
}

type Journal = Arc<Mutex<Vec<Call>>>;

/// Fixed, manually advanced clock
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Builder for instance snapshots carrying the test cluster's tags
pub struct InstanceBuilder {
    instance: ComputeInstance,
}

/// Running on-demand instance named like the fleet's instances
pub fn on_demand(id: &str, platform: Platform) -> InstanceBuilder {
    InstanceBuilder::new(id, platform, None)
}

/// Running spot instance
pub fn spot(id: &str, platform: Platform, request_id: &str) -> InstanceBuilder {
    InstanceBuilder::new(id, platform, Some(request_id.to_string()))
}

impl InstanceBuilder {
    fn new(id: &str, platform: Platform, spot_request_id: Option<String>) -> Self {
        let name = if spot_request_id.is_some() {
            tags::spot_instance_name(CLUSTER, platform)
        } else {
            tags::on_demand_instance_name(CLUSTER, platform)
        };
        let image_id = match platform {
            Platform::Linux => "ami-linux",
            Platform::Windows => "ami-windows",
        };
        let instance_tags = [
            (tags::NAME, name.as_str()),
            (tags::CREATOR, tags::CREATOR_ID),
            (tags::CLUSTER_NAME, CLUSTER),
            (tags::PLATFORM, platform.as_str()),
            (tags::SERVER_ID, SERVER_ID),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            instance: ComputeInstance {
                id: id.to_string(),
                platform,
                state: InstanceState::Running,
                image_id: image_id.to_string(),
                instance_type: "t3.large".to_string(),
                subnet_id: None,
                security_group_ids: vec!["sg-1".to_string()],
                tags: instance_tags,
                spot_request_id,
                launch_time: t0(),
            },
        }
    }

    pub fn state(mut self, state: InstanceState) -> Self {
        self.instance.state = state;
        self
    }

    pub fn stopped(self) -> Self {
        self.state(InstanceState::Stopped)
    }

    pub fn image(mut self, image_id: &str) -> Self {
        self.instance.image_id = image_id.to_string();
        self
    }

    pub fn instance_type(mut self, instance_type: &str) -> Self {
        self.instance.instance_type = instance_type.to_string();
        self
    }

    pub fn in_subnet(mut self, subnet_id: &str) -> Self {
        self.instance.subnet_id = Some(subnet_id.to_string());
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.instance.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn launched_at(mut self, at: DateTime<Utc>) -> Self {
        self.instance.launch_time = at;
        self
    }

    pub fn idle_since(self, at: DateTime<Utc>) -> Self {
        self.tag(tags::LAST_SEEN_IDLE, &millis_tag_value(at))
    }

    pub fn stopped_since(self, at: DateTime<Utc>) -> Self {
        self.tag(tags::STOPPED_AT, &millis_tag_value(at))
    }

    pub fn build(self) -> ComputeInstance {
        self.instance
    }
}

/// Connected, active registration with plenty of room
pub fn container_record(instance_id: &str, running_tasks: u32) -> ContainerInstanceRecord {
    let registered = Resources {
        cpu: 4096,
        memory: 16384,
    };
    ContainerInstanceRecord {
        arn: format!(
            "arn:aws:ecs:us-east-1:000000000000:container-instance/{}/{}",
            CLUSTER, instance_id
        ),
        ec2_instance_id: instance_id.to_string(),
        agent_connected: true,
        status: ContainerInstanceRecord::ACTIVE.to_string(),
        running_tasks,
        pending_tasks: 0,
        remaining: registered,
        registered,
    }
}

/// Spot request tagged for the test cluster and server
pub fn tagged_spot_request(
    id: &str,
    state: SpotRequestState,
    platform: Platform,
    instance_id: Option<&str>,
) -> SpotRequest {
    let request_tags = [
        (tags::SERVER_ID, SERVER_ID.to_string()),
        (tags::CREATOR, tags::CREATOR_ID.to_string()),
        (tags::CLUSTER_NAME, CLUSTER.to_string()),
        (tags::PLATFORM, platform.to_string()),
        (tags::NAME, tags::spot_instance_name(CLUSTER, platform)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    SpotRequest {
        id: id.to_string(),
        state,
        status_code: None,
        instance_id: instance_id.map(str::to_string),
        launch: SpotLaunchDetails {
            image_id: "ami-linux".to_string(),
            instance_type: "t3.large".to_string(),
            subnet_id: None,
            security_group_ids: vec!["sg-1".to_string()],
        },
        tags: request_tags,
    }
}

#[derive(Default)]
struct ComputeState {
    instances: Vec<ComputeInstance>,
    spot_requests: Vec<SpotRequest>,
    subnets: Vec<Subnet>,
    next_id: u32,
}

/// In-memory EC2
pub struct FakeCompute {
    state: Mutex<ComputeState>,
    cluster: Arc<FakeCluster>,
    clock: Arc<FixedClock>,
    journal: Journal,
    agent_connects: AtomicBool,
    hide_spot_requests: AtomicBool,
    spot_lookup_fails: AtomicBool,
    tagging_fails: AtomicBool,
    never_connect: Mutex<HashSet<String>>,
}

impl FakeCompute {
    pub fn add_instance(&self, instance: ComputeInstance) {
        self.state.lock().unwrap().instances.push(instance);
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state.lock().unwrap().subnets.push(subnet);
    }

    pub fn add_spot_request(&self, request: SpotRequest) {
        self.state.lock().unwrap().spot_requests.push(request);
    }

    pub fn instance(&self, id: &str) -> Option<ComputeInstance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn instances(&self) -> Vec<ComputeInstance> {
        self.state.lock().unwrap().instances.clone()
    }

    pub fn spot_requests(&self) -> Vec<SpotRequest> {
        self.state.lock().unwrap().spot_requests.clone()
    }

    /// Whether launched or started instances come up with a connected agent
    pub fn set_agent_connects(&self, connects: bool) {
        self.agent_connects.store(connects, Ordering::SeqCst);
    }

    /// Simulate listing lag: filtered spot request listings return nothing
    pub fn hide_spot_requests_from_listing(&self, hide: bool) {
        self.hide_spot_requests.store(hide, Ordering::SeqCst);
    }

    /// Simulate a request that never becomes queryable by id
    pub fn fail_spot_lookups(&self, fail: bool) {
        self.spot_lookup_fails.store(fail, Ordering::SeqCst);
    }

    /// The named instance never gets a connected agent, whatever `set_agent_connects` says
    pub fn agent_never_connects(&self, instance_id: &str) {
        self.never_connect.lock().unwrap().insert(instance_id.to_string());
    }

    /// Make every `create_tags` call fail
    pub fn fail_tagging(&self, fail: bool) {
        self.tagging_fails.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.journal.lock().unwrap().push(call);
    }

    fn register(&self, instance_id: &str) {
        let mut record = container_record(instance_id, 0);
        record.agent_connected = self.agent_connects.load(Ordering::SeqCst)
            && !self.never_connect.lock().unwrap().contains(instance_id);
        self.cluster.register(record);
    }

    fn set_state(&self, ids: &[String], state: InstanceState) {
        let mut guard = self.state.lock().unwrap();
        for instance in guard.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.state = state;
        }
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn describe_instances(&self, filter: &InstanceFilter) -> ApiResult<Vec<ComputeInstance>> {
        Ok(self
            .instances()
            .into_iter()
            .filter(|i| filter.matches(i))
            .collect())
    }

    async fn describe_instances_by_id(&self, ids: &[String]) -> ApiResult<Vec<ComputeInstance>> {
        Ok(self
            .instances()
            .into_iter()
            .filter(|i| ids.contains(&i.id))
            .collect())
    }

    async fn run_instances(&self, request: &RunInstancesRequest) -> ApiResult<Vec<ComputeInstance>> {
        self.record(Call::RunInstances {
            count: request.count,
        });

        let instance_tags: HashMap<String, String> = request.tags.iter().cloned().collect();
        let platform = instance_tags
            .get(tags::PLATFORM)
            .and_then(|p| p.parse().ok())
            .unwrap_or(Platform::Linux);

        let mut launched = Vec::new();
        {
            let mut guard = self.state.lock().unwrap();
            for _ in 0..request.count {
                guard.next_id += 1;
                let instance = ComputeInstance {
                    id: format!("i-new{:04}", guard.next_id),
                    platform,
                    state: InstanceState::Pending,
                    image_id: request.spec.image_id.clone(),
                    instance_type: request.spec.instance_type.clone(),
                    subnet_id: request.spec.subnet_id.clone(),
                    security_group_ids: request.spec.security_group_ids.clone(),
                    tags: instance_tags.clone(),
                    spot_request_id: None,
                    launch_time: self.clock.now(),
                };
                guard.instances.push(instance.clone());
                launched.push(instance);
            }
        }

        for instance in &launched {
            self.register(&instance.id);
        }
        Ok(launched)
    }

    async fn start_instances(&self, ids: &[String]) -> ApiResult<()> {
        self.record(Call::Start(ids.to_vec()));
        self.set_state(ids, InstanceState::Pending);
        for id in ids {
            self.register(id);
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> ApiResult<()> {
        self.record(Call::Stop(ids.to_vec()));
        self.set_state(ids, InstanceState::Stopped);
        for id in ids {
            self.cluster.disconnect(id);
        }
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> ApiResult<()> {
        self.record(Call::Terminate(ids.to_vec()));
        self.set_state(ids, InstanceState::Terminated);
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], new_tags: &[(String, String)]) -> ApiResult<()> {
        self.record(Call::CreateTags(resource_ids.to_vec()));
        if self.tagging_fails.load(Ordering::SeqCst) {
            return Err(ApiError::service("CreateTags", "tagging rejected"));
        }
        let mut guard = self.state.lock().unwrap();
        for instance in guard
            .instances
            .iter_mut()
            .filter(|i| resource_ids.contains(&i.id))
        {
            instance.tags.extend(new_tags.iter().cloned());
        }
        for request in guard
            .spot_requests
            .iter_mut()
            .filter(|r| resource_ids.contains(&r.id))
        {
            request.tags.extend(new_tags.iter().cloned());
        }
        Ok(())
    }

    async fn delete_tags(&self, resource_ids: &[String], keys: &[&str]) -> ApiResult<()> {
        self.record(Call::DeleteTags(resource_ids.to_vec()));
        let mut guard = self.state.lock().unwrap();
        for instance in guard
            .instances
            .iter_mut()
            .filter(|i| resource_ids.contains(&i.id))
        {
            for key in keys {
                instance.tags.remove(*key);
            }
        }
        Ok(())
    }

    async fn request_spot_instance(&self, request: &SpotInstanceRequest) -> ApiResult<SpotRequest> {
        self.record(Call::RequestSpot);
        let mut guard = self.state.lock().unwrap();
        guard.next_id += 1;
        let spot_request = SpotRequest {
            id: format!("sir-{:04}", guard.next_id),
            state: SpotRequestState::Open,
            status_code: Some("pending-evaluation".to_string()),
            instance_id: None,
            launch: SpotLaunchDetails {
                image_id: request.spec.image_id.clone(),
                instance_type: request.spec.instance_type.clone(),
                subnet_id: request.spec.subnet_id.clone(),
                security_group_ids: request.spec.security_group_ids.clone(),
            },
            tags: HashMap::new(),
        };
        guard.spot_requests.push(spot_request.clone());
        Ok(spot_request)
    }

    async fn describe_spot_requests(&self, filter: &SpotRequestFilter) -> ApiResult<Vec<SpotRequest>> {
        if self.hide_spot_requests.load(Ordering::SeqCst) {
            return Ok(vec![]);
        }
        Ok(self
            .spot_requests()
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    async fn describe_spot_requests_by_id(&self, ids: &[String]) -> ApiResult<Vec<SpotRequest>> {
        let requests = if self.spot_lookup_fails.load(Ordering::SeqCst) {
            vec![]
        } else {
            self.spot_requests()
        };
        let mut found = Vec::new();
        for id in ids {
            match requests.iter().find(|r| &r.id == id) {
                Some(request) => found.push(request.clone()),
                None => {
                    return Err(ApiError::from_code(
                        "DescribeSpotInstanceRequests",
                        Some("InvalidSpotInstanceRequestID.NotFound".to_string()),
                        format!("The spot instance request ID '{}' does not exist", id),
                    ));
                }
            }
        }
        Ok(found)
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> ApiResult<()> {
        self.record(Call::CancelSpot(ids.to_vec()));
        let mut guard = self.state.lock().unwrap();
        for request in guard.spot_requests.iter_mut().filter(|r| ids.contains(&r.id)) {
            request.state = SpotRequestState::Cancelled;
            request.status_code = Some("request-canceled".to_string());
        }
        Ok(())
    }

    async fn describe_subnets(&self, ids: &[String]) -> ApiResult<Vec<Subnet>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subnets
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect())
    }
}

struct ClusterState {
    exists: bool,
    records: Vec<ContainerInstanceRecord>,
}

/// In-memory ECS cluster
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    journal: Journal,
}

impl FakeCluster {
    /// Add or replace the registration of the record's instance
    pub fn register(&self, record: ContainerInstanceRecord) {
        let mut guard = self.state.lock().unwrap();
        guard
            .records
            .retain(|r| r.ec2_instance_id != record.ec2_instance_id);
        guard.records.push(record);
    }

    pub fn record(&self, instance_id: &str) -> Option<ContainerInstanceRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|r| r.ec2_instance_id == instance_id)
            .cloned()
    }

    pub fn set_running_tasks(&self, instance_id: &str, running_tasks: u32) {
        let mut guard = self.state.lock().unwrap();
        for record in guard
            .records
            .iter_mut()
            .filter(|r| r.ec2_instance_id == instance_id)
        {
            record.running_tasks = running_tasks;
        }
    }

    pub fn set_exists(&self, exists: bool) {
        self.state.lock().unwrap().exists = exists;
    }

    fn disconnect(&self, instance_id: &str) {
        let mut guard = self.state.lock().unwrap();
        for record in guard
            .records
            .iter_mut()
            .filter(|r| r.ec2_instance_id == instance_id)
        {
            record.agent_connected = false;
        }
    }
}

#[async_trait]
impl ContainerClusterApi for FakeCluster {
    async fn describe_cluster(&self, cluster: &str) -> ApiResult<Option<ClusterInfo>> {
        let guard = self.state.lock().unwrap();
        if !guard.exists {
            return Ok(None);
        }
        Ok(Some(ClusterInfo {
            name: cluster.to_string(),
            arn: format!("arn:aws:ecs:us-east-1:000000000000:cluster/{}", cluster),
            status: "ACTIVE".to_string(),
            registered_instances: guard.records.len() as u32,
        }))
    }

    async fn list_container_instances(&self, _cluster: &str) -> ApiResult<Vec<ContainerInstanceRecord>> {
        Ok(self.state.lock().unwrap().records.clone())
    }

    async fn deregister_container_instance(&self, _cluster: &str, arn: &str) -> ApiResult<()> {
        self.journal.lock().unwrap().push(Call::Deregister(arn.to_string()));
        let mut guard = self.state.lock().unwrap();
        let before = guard.records.len();
        guard.records.retain(|r| r.arn != arn);
        if guard.records.len() == before {
            return Err(ApiError::from_code(
                "DeregisterContainerInstance",
                Some("InvalidParameterException".to_string()),
                format!("Container instance {} not found", arn),
            ));
        }
        Ok(())
    }
}

/// Wired set of fakes sharing one journal and one clock
pub struct Fakes {
    pub clock: Arc<FixedClock>,
    pub compute: Arc<FakeCompute>,
    pub cluster: Arc<FakeCluster>,
    journal: Journal,
}

impl Fakes {
    pub fn new() -> Self {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let clock = Arc::new(FixedClock::new(t0()));
        let cluster = Arc::new(FakeCluster {
            state: Mutex::new(ClusterState {
                exists: true,
                records: Vec::new(),
            }),
            journal: journal.clone(),
        });
        let compute = Arc::new(FakeCompute {
            state: Mutex::new(ComputeState::default()),
            cluster: cluster.clone(),
            clock: clock.clone(),
            journal: journal.clone(),
            agent_connects: AtomicBool::new(true),
            hide_spot_requests: AtomicBool::new(false),
            spot_lookup_fails: AtomicBool::new(false),
            tagging_fails: AtomicBool::new(false),
            never_connect: Mutex::new(HashSet::new()),
        });

        Self {
            clock,
            compute,
            cluster,
            journal,
        }
    }

    pub fn inventory(&self) -> Inventory {
        Inventory::new(self.compute.clone(), self.cluster.clone(), self.clock.clone())
    }

    /// Add an instance together with a connected registration
    pub fn registered(&self, instance: ComputeInstance, running_tasks: u32) {
        self.cluster
            .register(container_record(&instance.id, running_tasks));
        self.compute.add_instance(instance);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.journal.lock().unwrap().clear();
    }
}
