//! Spot instance controller
//!
//! Spot capacity is requested, not launched: a request is issued, becomes visible by id
//! after a short delay, gets tagged, and only later is fulfilled by an instance that
//! registers with the cluster. Tag-filtered listings lag behind creation, so requests
//! issued by this process are remembered in a local cache until a listing shows them.
//! Without it two back-to-back decisions would both see "nothing pending" and request
//! twice.

use ecsfleet_core::{
    Platform, RegisteredInstance, SpotInstanceRequest, SpotRequest, SpotRequestFilter,
    SpotRequestState, millis_tag_value, tags,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::capacity::PlatformLocks;
use crate::config::{ClusterSettings, ResolvedInstanceConfig};
use crate::error::{OrchestratorError, Result};
use crate::idle::spot_eligible_for_termination;
use crate::inventory::Inventory;
use crate::matcher::spot_request_matches;
use crate::subnet::SubnetSelector;
use crate::wait::{DEFAULT_RETRY_INTERVAL, Poller};

/// How long a new spot request gets to become queryable by id
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(25);

/// Requests issued by this process that tag-filtered listings do not show yet
#[derive(Debug, Default)]
pub struct UntaggedSpotRequests {
    requests: HashMap<String, SpotRequest>,
}

impl UntaggedSpotRequests {
    pub fn insert(&mut self, request: SpotRequest) {
        self.requests.insert(request.id.clone(), request);
    }

    /// Forget every cached request present in `visible`; returns how many remain
    pub fn refresh(&mut self, visible: &[SpotRequest]) -> usize {
        for request in visible {
            if self.requests.remove(&request.id).is_some() {
                debug!(request_id = %request.id, "Spot request now visible in listings");
            }
        }
        self.requests.len()
    }

    pub fn snapshot(&self) -> Vec<SpotRequest> {
        self.requests.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Requests spot capacity and maintains spot instances over their life
pub struct SpotInstanceController {
    inventory: Inventory,
    subnets: SubnetSelector,
    locks: Arc<PlatformLocks>,
    untagged: Mutex<UntaggedSpotRequests>,
    visibility_timeout: Duration,
    retry_interval: Duration,
}

impl SpotInstanceController {
    pub fn new(inventory: Inventory, locks: Arc<PlatformLocks>) -> Self {
        let subnets = SubnetSelector::new(inventory.compute().clone());
        Self {
            inventory,
            subnets,
            locks,
            untagged: Mutex::new(UntaggedSpotRequests::default()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Make sure a spot instance matching `config` is on its way.
    ///
    /// Returns without requesting anything when a pending request already matches.
    /// Fails with [`OrchestratorError::SpotCapacityExceeded`] when registered spot
    /// instances plus pending requests reach the platform's spot ceiling.
    pub async fn request_spot_capacity(
        &self,
        settings: &ClusterSettings,
        config: &ResolvedInstanceConfig,
    ) -> Result<()> {
        if !config.run_as_spot {
            return Err(OrchestratorError::config(
                "On-demand capacity is provided by the capacity manager",
            ));
        }

        let platform = config.platform;
        let _guard = self.locks.lock(platform).await;

        let registered = self.registered_spot_instances(settings, Some(platform)).await?;
        // The cache is shared across platforms: hold it only while counting
        let pending = {
            let mut untagged = self.untagged.lock().await;
            self.refresh_cache(settings, &mut untagged).await?;
            self.pending_requests(settings, platform, &registered, &untagged)
                .await?
        };
        debug!(
            %platform,
            registered = registered.len(),
            pending = pending.len(),
            "Current spot capacity"
        );

        if let Some(request) = pending.iter().find(|r| spot_request_matches(config, r)) {
            info!(%platform, request_id = %request.id, "A matching spot request is already pending");
            return Ok(());
        }

        let max = config.max_spot_instances;
        if (registered.len() + pending.len()) as u32 >= max {
            return Err(OrchestratorError::SpotCapacityExceeded { platform, max });
        }

        let all = self.inventory.all_instances(settings).await?;
        let subnet = self.subnets.select(&config.subnet_ids, &all).await?;
        let request = SpotInstanceRequest {
            spec: config.launch_specification(subnet),
            spot_price: config.spot_price.clone(),
            valid_until: Some(self.inventory.now() + config.spot_request_expiry),
        };

        let created = self
            .inventory
            .compute()
            .request_spot_instance(&request)
            .await?;
        info!(%platform, request_id = %created.id, "Requested spot instance");

        let Some(mut visible) = self.wait_until_visible(&created.id).await else {
            self.cancel(&created.id).await;
            return Err(OrchestratorError::SpotRequestNotVisible(created.id));
        };

        let request_tags = spot_tags(settings, platform);
        if let Err(e) = self
            .inventory
            .compute()
            .create_tags(&[visible.id.clone()], &request_tags)
            .await
        {
            warn!(request_id = %visible.id, error = %e, "Failed to tag spot request, cancelling it");
            self.cancel(&visible.id).await;
            return Err(e.into());
        }

        if visible.is_open_or_active() {
            visible.tags.extend(request_tags);
            self.untagged.lock().await.insert(visible);
        }

        Ok(())
    }

    /// Drop cached requests that listings now show; returns how many are still cached
    pub async fn refresh_untagged_spot_requests(&self, settings: &ClusterSettings) -> Result<usize> {
        let mut untagged = self.untagged.lock().await;
        self.refresh_cache(settings, &mut untagged).await
    }

    /// Copy the spot tag set onto instances fulfilling this server's requests.
    ///
    /// Returns the number of instances tagged.
    pub async fn tag_spot_instances(&self, settings: &ClusterSettings) -> Result<usize> {
        let filter = owner_filter(settings)
            .with_states(&[SpotRequestState::Active, SpotRequestState::Cancelled]);
        let requests = self
            .inventory
            .compute()
            .describe_spot_requests(&filter)
            .await?;

        let mut by_platform: HashMap<Platform, Vec<String>> = HashMap::new();
        for request in requests {
            let fulfilled = request.state == SpotRequestState::Active
                || request.is_cancelled_with_running_instance();
            let (Some(instance_id), Some(platform)) = (request.instance_id.as_ref(), request.platform())
            else {
                continue;
            };
            if fulfilled {
                by_platform
                    .entry(platform)
                    .or_default()
                    .push(instance_id.clone());
            }
        }

        let mut tagged = 0;
        for (platform, ids) in by_platform {
            self.inventory
                .compute()
                .create_tags(&ids, &spot_tags(settings, platform))
                .await?;
            debug!(%platform, instances = ?ids, "Tagged spot instances");
            tagged += ids.len();
        }
        Ok(tagged)
    }

    /// Stamp `last-seen-idle` on idle spot instances, and clear it from busy ones
    pub async fn tag_idle_spot_instances(&self, settings: &ClusterSettings) -> Result<usize> {
        let registered = self.registered_spot_instances(settings, None).await?;

        let newly_idle: Vec<String> = registered
            .iter()
            .filter(|r| r.is_idle() && !r.instance.has_tag(tags::LAST_SEEN_IDLE))
            .map(|r| r.id().to_string())
            .collect();
        let busy_again: Vec<String> = registered
            .iter()
            .filter(|r| !r.is_idle() && r.instance.has_tag(tags::LAST_SEEN_IDLE))
            .map(|r| r.id().to_string())
            .collect();

        if !newly_idle.is_empty() {
            let now = millis_tag_value(self.inventory.now());
            self.inventory
                .compute()
                .create_tags(&newly_idle, &[(tags::LAST_SEEN_IDLE.to_string(), now)])
                .await?;
            debug!(instances = ?newly_idle, "Marked spot instances idle");
        }
        self.inventory.remove_idle_tag(&busy_again).await?;

        Ok(newly_idle.len())
    }

    /// Deregister and terminate spot instances idle past their platform's threshold
    pub async fn terminate_idle_spot_instances(&self, settings: &ClusterSettings) -> Result<usize> {
        let now = self.inventory.now();
        let idle: Vec<RegisteredInstance> = self
            .registered_spot_instances(settings, None)
            .await?
            .into_iter()
            .filter(|r| r.is_idle() && spot_eligible_for_termination(&r.instance, settings, now))
            .collect();

        if idle.is_empty() {
            return Ok(0);
        }

        self.inventory.terminate_registered(settings, &idle).await?;
        info!(count = idle.len(), "Terminated idle spot instances");
        Ok(idle.len())
    }

    async fn registered_spot_instances(
        &self,
        settings: &ClusterSettings,
        platform: Option<Platform>,
    ) -> Result<Vec<RegisteredInstance>> {
        Ok(self
            .inventory
            .registered_instances(settings)
            .await?
            .into_iter()
            .filter(|r| {
                r.instance.is_spot()
                    && r.instance.state.is_active()
                    && platform.is_none_or(|p| r.instance.platform == p)
            })
            .collect())
    }

    async fn refresh_cache(
        &self,
        settings: &ClusterSettings,
        untagged: &mut UntaggedSpotRequests,
    ) -> Result<usize> {
        if untagged.is_empty() {
            return Ok(0);
        }

        let visible = self
            .inventory
            .compute()
            .describe_spot_requests(&owner_filter(settings))
            .await?;
        Ok(untagged.refresh(&visible))
    }

    /// Live requests of `platform` whose instance has not joined the cluster yet
    async fn pending_requests(
        &self,
        settings: &ClusterSettings,
        platform: Platform,
        registered: &[RegisteredInstance],
        untagged: &UntaggedSpotRequests,
    ) -> Result<Vec<SpotRequest>> {
        let filter = owner_filter(settings)
            .with_tag(tags::PLATFORM, platform.as_str())
            .with_states(&[
                SpotRequestState::Open,
                SpotRequestState::Active,
                SpotRequestState::Cancelled,
            ]);
        let listed = self
            .inventory
            .compute()
            .describe_spot_requests(&filter)
            .await?;

        let registered_ids: HashSet<&str> = registered.iter().map(|r| r.id()).collect();
        let not_registered = |request: &SpotRequest| {
            request
                .instance_id
                .as_deref()
                .is_none_or(|id| !registered_ids.contains(id))
        };

        let mut seen = HashSet::new();
        let pending = listed
            .into_iter()
            .filter(|r| r.is_live())
            .chain(
                untagged
                    .snapshot()
                    .into_iter()
                    .filter(|r| r.platform() == Some(platform)),
            )
            .filter(|r| not_registered(r) && seen.insert(r.id.clone()))
            .collect();
        Ok(pending)
    }

    async fn wait_until_visible(&self, request_id: &str) -> Option<SpotRequest> {
        let compute = self.inventory.compute();
        let ids = [request_id.to_string()];
        let ids = &ids;

        Poller::new(self.visibility_timeout)
            .retry_after(self.retry_interval)
            .poll(
                move || async move { compute.describe_spot_requests_by_id(ids).await },
                |requests: &Vec<SpotRequest>| !requests.is_empty(),
            )
            .await
            .into_value()
            .and_then(|requests| requests.into_iter().next())
    }

    async fn cancel(&self, request_id: &str) {
        match self
            .inventory
            .compute()
            .cancel_spot_requests(&[request_id.to_string()])
            .await
        {
            Ok(()) => info!(request_id, "Cancelled spot request"),
            Err(e) => warn!(request_id, error = %e, "Failed to cancel spot request"),
        }
    }
}

/// Requests created by this server for this cluster
fn owner_filter(settings: &ClusterSettings) -> SpotRequestFilter {
    SpotRequestFilter::new()
        .with_tag(tags::CREATOR, tags::CREATOR_ID)
        .with_tag(tags::CLUSTER_NAME, settings.cluster_name.as_str())
        .with_tag(tags::SERVER_ID, settings.server_id.as_str())
}

fn spot_tags(settings: &ClusterSettings, platform: Platform) -> Vec<(String, String)> {
    vec![
        (tags::SERVER_ID.to_string(), settings.server_id.clone()),
        (tags::CREATOR.to_string(), tags::CREATOR_ID.to_string()),
        (tags::CLUSTER_NAME.to_string(), settings.cluster_name.clone()),
        (tags::PLATFORM.to_string(), platform.to_string()),
        (
            tags::NAME.to_string(),
            tags::spot_instance_name(&settings.cluster_name, platform),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElasticProfile;
    use crate::testing::{Call, Fakes, on_demand, spot, t0, tagged_spot_request, test_settings};
    use tokio_test::{assert_err, assert_ok};

    fn controller(fakes: &Fakes) -> SpotInstanceController {
        SpotInstanceController::new(fakes.inventory(), Arc::new(PlatformLocks::new()))
    }

    fn spot_config(settings: &ClusterSettings) -> ResolvedInstanceConfig {
        ResolvedInstanceConfig::resolve(settings, &ElasticProfile::empty(Platform::Linux).spot(None))
            .unwrap()
    }

    fn requests_issued(fakes: &Fakes) -> usize {
        fakes.count(|c| *c == Call::RequestSpot)
    }

    #[test]
    fn test_cache_refresh_prunes_visible_requests() {
        let mut cache = UntaggedSpotRequests::default();
        cache.insert(tagged_spot_request("sir-1", SpotRequestState::Open, Platform::Linux, None));
        cache.insert(tagged_spot_request("sir-2", SpotRequestState::Open, Platform::Linux, None));

        let visible = vec![tagged_spot_request("sir-1", SpotRequestState::Open, Platform::Linux, None)];
        assert_eq!(cache.refresh(&visible), 1);
        assert_eq!(cache.snapshot()[0].id, "sir-2");

        assert_eq!(cache.refresh(&[]), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_requests_issue_one_spot_request() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes.compute.hide_spot_requests_from_listing(true);
        let controller = controller(&fakes);
        let config = spot_config(&settings);

        assert_ok!(controller.request_spot_capacity(&settings, &config).await);
        assert_ok!(controller.request_spot_capacity(&settings, &config).await);
        assert_eq!(requests_issued(&fakes), 1);

        let request = &fakes.compute.spot_requests()[0];
        assert_eq!(request.platform(), Some(Platform::Linux));
        assert_eq!(
            request.tags.get(tags::NAME).map(String::as_str),
            Some("build_LINUX_SPOT_INSTANCE")
        );
    }

    #[tokio::test]
    async fn test_visible_pending_request_is_reused() {
        let fakes = Fakes::new();
        let settings = test_settings();
        let controller = controller(&fakes);
        let config = spot_config(&settings);

        assert_ok!(controller.request_spot_capacity(&settings, &config).await);
        assert_eq!(assert_ok!(controller.refresh_untagged_spot_requests(&settings).await), 0);
        assert_ok!(controller.request_spot_capacity(&settings, &config).await);
        assert_eq!(requests_issued(&fakes), 1);
    }

    #[tokio::test]
    async fn test_ceiling_counts_registered_and_pending() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes.registered(spot("i-spot", Platform::Linux, "sir-1").build(), 1);
        let mut other = tagged_spot_request("sir-2", SpotRequestState::Open, Platform::Linux, None);
        other.launch.image_id = "ami-other".to_string();
        fakes.compute.add_spot_request(other);

        let result = controller(&fakes)
            .request_spot_capacity(&settings, &spot_config(&settings))
            .await;
        let err = assert_err!(result);
        assert!(matches!(err, OrchestratorError::SpotCapacityExceeded { max: 2, .. }));
        assert_eq!(requests_issued(&fakes), 0);
    }

    #[tokio::test]
    async fn test_request_with_registered_instance_is_not_pending() {
        let fakes = Fakes::new();
        let mut settings = test_settings();
        settings.linux.max_spot_instances = 2;
        fakes.registered(spot("i-spot", Platform::Linux, "sir-1").build(), 1);
        fakes.compute.add_spot_request(tagged_spot_request(
            "sir-1",
            SpotRequestState::Active,
            Platform::Linux,
            Some("i-spot"),
        ));

        assert_ok!(
            controller(&fakes)
                .request_spot_capacity(&settings, &spot_config(&settings))
                .await
        );
        assert_eq!(requests_issued(&fakes), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invisible_request_is_cancelled() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes.compute.fail_spot_lookups(true);

        let result = controller(&fakes)
            .request_spot_capacity(&settings, &spot_config(&settings))
            .await;
        assert!(matches!(assert_err!(result), OrchestratorError::SpotRequestNotVisible(_)));
        assert_eq!(fakes.count(|c| matches!(c, Call::CancelSpot(_))), 1);
        assert_eq!(fakes.compute.spot_requests()[0].state, SpotRequestState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_wait_does_not_block_the_cache() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes.compute.fail_spot_lookups(true);
        let controller = Arc::new(controller(&fakes));

        let pending = tokio::spawn({
            let controller = controller.clone();
            let settings = settings.clone();
            async move {
                let config = spot_config(&settings);
                controller.request_spot_capacity(&settings, &config).await
            }
        });
        while requests_issued(&fakes) == 0 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        assert_ok!(controller.refresh_untagged_spot_requests(&settings).await);
        assert!(started.elapsed() < DEFAULT_VISIBILITY_TIMEOUT);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(OrchestratorError::SpotRequestNotVisible(_))));
    }

    #[tokio::test]
    async fn test_untaggable_request_is_cancelled_and_not_cached() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes.compute.fail_tagging(true);
        fakes.compute.hide_spot_requests_from_listing(true);
        let controller = controller(&fakes);

        let result = controller
            .request_spot_capacity(&settings, &spot_config(&settings))
            .await;
        assert!(matches!(assert_err!(result), OrchestratorError::Api(_)));

        let request_id = fakes.compute.spot_requests()[0].id.clone();
        assert!(fakes.calls().contains(&Call::CancelSpot(vec![request_id])));
        assert_eq!(assert_ok!(controller.refresh_untagged_spot_requests(&settings).await), 0);
    }

    #[tokio::test]
    async fn test_on_demand_config_is_rejected() {
        let fakes = Fakes::new();
        let settings = test_settings();
        let config =
            ResolvedInstanceConfig::resolve(&settings, &ElasticProfile::empty(Platform::Linux)).unwrap();

        let result = controller(&fakes).request_spot_capacity(&settings, &config).await;
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[tokio::test]
    async fn test_tag_spot_instances_of_fulfilled_requests() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes
            .compute
            .add_instance(spot("i-spot", Platform::Linux, "sir-1").tag(tags::NAME, "unnamed").build());
        fakes.compute.add_spot_request(tagged_spot_request(
            "sir-1",
            SpotRequestState::Active,
            Platform::Linux,
            Some("i-spot"),
        ));
        fakes.compute.add_spot_request(tagged_spot_request(
            "sir-2",
            SpotRequestState::Open,
            Platform::Linux,
            None,
        ));

        let tagged = assert_ok!(controller(&fakes).tag_spot_instances(&settings).await);
        assert_eq!(tagged, 1);
        assert_eq!(
            fakes.compute.instance("i-spot").unwrap().name(),
            Some("build_LINUX_SPOT_INSTANCE")
        );
    }

    #[tokio::test]
    async fn test_idle_spot_instances_are_tagged_then_terminated() {
        let fakes = Fakes::new();
        let settings = test_settings();
        fakes.registered(spot("i-idle", Platform::Linux, "sir-1").build(), 0);
        fakes.registered(spot("i-busy", Platform::Linux, "sir-2").build(), 1);
        fakes.registered(on_demand("i-od", Platform::Linux).build(), 0);
        let controller = controller(&fakes);

        assert_eq!(assert_ok!(controller.tag_idle_spot_instances(&settings).await), 1);
        assert_eq!(fakes.compute.instance("i-idle").unwrap().last_seen_idle(), Some(t0()));
        assert!(!fakes.compute.instance("i-od").unwrap().has_tag(tags::LAST_SEEN_IDLE));

        assert_eq!(assert_ok!(controller.terminate_idle_spot_instances(&settings).await), 0);

        fakes.clock.advance(settings.linux.terminate_idle_spot_after() + chrono::Duration::minutes(1));
        assert_eq!(assert_ok!(controller.terminate_idle_spot_instances(&settings).await), 1);
        assert!(fakes.calls().contains(&Call::Terminate(vec!["i-idle".to_string()])));
        assert!(fakes.cluster.record("i-busy").is_some());
    }
}
