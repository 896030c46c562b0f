//! Subnet placement for new instances and spot requests

use ecsfleet_core::{ComputeApi, ComputeInstance, SubnetState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

/// Picks the available candidate subnet hosting the fewest instances
#[derive(Clone)]
pub struct SubnetSelector {
    compute: Arc<dyn ComputeApi>,
}

impl SubnetSelector {
    pub fn new(compute: Arc<dyn ComputeApi>) -> Self {
        Self { compute }
    }

    /// Select a subnet among `candidate_ids`.
    ///
    /// Returns `None` when no candidate is configured, leaving placement to the provider.
    /// Fails with [`OrchestratorError::SubnetUnavailable`] when none of the candidates is
    /// available.
    pub async fn select(
        &self,
        candidate_ids: &[String],
        instances: &[ComputeInstance],
    ) -> Result<Option<String>> {
        if candidate_ids.is_empty() {
            info!("No subnet configured, the provider assigns a default subnet");
            return Ok(None);
        }

        let described = self.compute.describe_subnets(candidate_ids).await?;
        let available: Vec<&String> = candidate_ids
            .iter()
            .filter(|id| {
                described
                    .iter()
                    .any(|s| &s.id == *id && s.state == SubnetState::Available)
            })
            .collect();

        if available.is_empty() {
            return Err(OrchestratorError::SubnetUnavailable(candidate_ids.to_vec()));
        }

        let mut per_subnet: HashMap<&str, usize> = HashMap::new();
        for instance in instances {
            if let Some(subnet) = instance.subnet_id.as_deref() {
                *per_subnet.entry(subnet).or_default() += 1;
            }
        }

        // First candidate wins ties, so an empty inventory picks the first available one
        let selected = available
            .iter()
            .min_by_key(|id| per_subnet.get(id.as_str()).copied().unwrap_or(0))
            .map(|id| (*id).clone());

        debug!(subnet = ?selected, "Selected subnet");
        Ok(selected)
    }
}
