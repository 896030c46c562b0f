//! Idle bookkeeping: how long instances have been idle or stopped

use chrono::{DateTime, Duration, Utc};
use ecsfleet_core::{ComputeInstance, InstanceState};
use std::cmp::Ordering;

use crate::config::ClusterSettings;

/// Time since the instance was last seen idle; untagged instances count as not idle
pub fn idle_elapsed(instance: &ComputeInstance, now: DateTime<Utc>) -> Duration {
    instance
        .last_seen_idle()
        .map(|since| now - since)
        .unwrap_or_else(Duration::zero)
}

/// Orders the most idle instance first.
///
/// Ties fall back to the earliest launch, then to the instance id, so the choice is stable.
pub fn most_idle_ordering(a: &ComputeInstance, b: &ComputeInstance, now: DateTime<Utc>) -> Ordering {
    idle_elapsed(b, now)
        .cmp(&idle_elapsed(a, now))
        .then_with(|| a.launch_time.cmp(&b.launch_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// Carries an idle tag older than `threshold`
pub fn idle_longer_than(instance: &ComputeInstance, threshold: Duration, now: DateTime<Utc>) -> bool {
    instance
        .last_seen_idle()
        .is_some_and(|since| now > since + threshold)
}

/// A stopped instance past its platform's terminate-after-stop threshold.
///
/// A stopped instance without a `stopped-at` tag was not stopped by us and is always eligible.
pub fn eligible_for_termination(
    instance: &ComputeInstance,
    settings: &ClusterSettings,
    now: DateTime<Utc>,
) -> bool {
    if instance.state != InstanceState::Stopped {
        return false;
    }

    match instance.stopped_at() {
        None => true,
        Some(stopped_at) => {
            now > stopped_at + settings.platform(instance.platform).terminate_stopped_after()
        }
    }
}

/// A spot instance idle past its platform's threshold; never eligible without an idle tag
pub fn spot_eligible_for_termination(
    instance: &ComputeInstance,
    settings: &ClusterSettings,
    now: DateTime<Utc>,
) -> bool {
    idle_longer_than(
        instance,
        settings.platform(instance.platform).terminate_idle_spot_after(),
        now,
    )
}
