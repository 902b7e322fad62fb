use crate::exception::LeaderResult;
use crate::metadata::{MetadataStore, PodRecord};
use crate::role::LabelSelector;
use std::sync::Arc;
use tracing::warn;

/// Where the current primary can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryEndpoint {
    pub pod_name: String,
    pub address: String,
}

/// Looks up the pod currently labeled primary
#[derive(Clone)]
pub struct PrimaryDiscovery {
    store: Arc<dyn MetadataStore>,
}

impl PrimaryDiscovery {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// First pod labeled primary in the cluster, by listing order.
    ///
    /// Returns `Ok(None)` when nothing is labeled primary or the chosen pod has no
    /// address yet. Store failures are returned to the caller, which owns retries.
    pub async fn find_primary(&self, cluster_name: &str) -> LeaderResult<Option<PrimaryEndpoint>> {
        self.find_primary_preferring(cluster_name, None).await
    }

    /// Like [`find_primary`](Self::find_primary), but when several pods are labeled
    /// primary at once the one at `preferred_address` (the observed lease holder) wins.
    pub async fn find_primary_preferring(
        &self,
        cluster_name: &str,
        preferred_address: Option<&str>,
    ) -> LeaderResult<Option<PrimaryEndpoint>> {
        let candidates = self.store.list(&LabelSelector::primary_of(cluster_name)).await?;

        if candidates.len() > 1 {
            warn!(
                cluster_name,
                count = candidates.len(),
                "multiple pods labeled primary"
            );
        }

        let chosen = preferred_address
            .and_then(|preferred| {
                candidates
                    .iter()
                    .find(|pod| pod.address.as_deref() == Some(preferred))
            })
            .or_else(|| candidates.first());

        Ok(chosen.and_then(Self::endpoint))
    }

    fn endpoint(pod: &PodRecord) -> Option<PrimaryEndpoint> {
        match pod.address.as_deref() {
            Some(address) if !address.is_empty() => Some(PrimaryEndpoint {
                pod_name: pod.name.clone(),
                address: address.to_string(),
            }),
            _ => {
                warn!(primary_pod = %pod.name, "primary pod has no IP address");
                None
            }
        }
    }
}
