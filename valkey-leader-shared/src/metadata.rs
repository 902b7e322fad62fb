//! Pod metadata store: the label key-value view other agents read roles from.

use crate::exception::{LeaderError, LeaderResult};
use crate::role::LabelSelector;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Label changes to apply; `None` removes the key.
pub type LabelDelta = BTreeMap<String, Option<String>>;

/// The slice of a pod the agent cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    /// Pod IP, `None` until the pod has been assigned one
    pub address: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl PodRecord {
    pub fn new<N: Into<String>>(name: N, address: Option<&str>) -> Self {
        Self {
            name: name.into(),
            address: address.map(str::to_string),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Cluster membership metadata, last-write-wins per label
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Pods matching every term of the selector, in the store's listing order.
    async fn list(&self, selector: &LabelSelector) -> LeaderResult<Vec<PodRecord>>;

    async fn get(&self, name: &str) -> LeaderResult<PodRecord>;

    /// Apply a label delta to one pod. Either the whole delta lands or nothing does.
    async fn update_labels(&self, name: &str, delta: &LabelDelta) -> LeaderResult<()>;
}

/// Pod labels through the Kubernetes API
pub struct KubePodStore {
    pods: Api<Pod>,
}

impl KubePodStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }

    fn record(pod: &Pod) -> PodRecord {
        PodRecord {
            name: pod.name_any(),
            address: pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.clone())
                .filter(|ip| !ip.is_empty()),
            labels: pod.labels().clone(),
        }
    }
}

#[async_trait]
impl MetadataStore for KubePodStore {
    async fn list(&self, selector: &LabelSelector) -> LeaderResult<Vec<PodRecord>> {
        let params = ListParams::default().labels(&selector.to_string());
        let pods = self.pods.list(&params).await?;
        Ok(pods.items.iter().map(Self::record).collect())
    }

    async fn get(&self, name: &str) -> LeaderResult<PodRecord> {
        match self.pods.get(name).await {
            Ok(pod) => Ok(Self::record(&pod)),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(LeaderError::PodNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_labels(&self, name: &str, delta: &LabelDelta) -> LeaderResult<()> {
        debug!(pod_name = name, ?delta, "patching pod labels");
        let patch = json!({
            "metadata": {
                "labels": delta
            }
        });
        self.pods
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// In-process store used by tests and local simulations
#[derive(Default)]
pub struct InMemoryMetadataStore {
    pods: RwLock<BTreeMap<String, PodRecord>>,
    unavailable: AtomicBool,
    hanging: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pod(&self, pod: PodRecord) {
        self.pods.write().await.insert(pod.name.clone(), pod);
    }

    /// Make every subsequent call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Make every subsequent call stall forever, like an API server that stopped answering.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::Release);
    }

    async fn check_available(&self) -> LeaderResult<()> {
        if self.hanging.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(LeaderError::metadata("metadata store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn list(&self, selector: &LabelSelector) -> LeaderResult<Vec<PodRecord>> {
        self.check_available().await?;
        let pods = self.pods.read().await;
        Ok(pods
            .values()
            .filter(|pod| selector.matches(&pod.labels))
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> LeaderResult<PodRecord> {
        self.check_available().await?;
        self.pods
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LeaderError::PodNotFound {
                name: name.to_string(),
            })
    }

    async fn update_labels(&self, name: &str, delta: &LabelDelta) -> LeaderResult<()> {
        self.check_available().await?;
        let mut pods = self.pods.write().await;
        let pod = pods.get_mut(name).ok_or_else(|| LeaderError::PodNotFound {
            name: name.to_string(),
        })?;

        for (key, value) in delta {
            match value {
                Some(value) => {
                    pod.labels.insert(key.clone(), value.clone());
                }
                None => {
                    pod.labels.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{CLUSTER_LABEL, ROLE_LABEL};

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = InMemoryMetadataStore::new();
        store
            .insert_pod(
                PodRecord::new("valkey-0", Some("10.0.0.1"))
                    .with_label(CLUSTER_LABEL, "demo")
                    .with_label(ROLE_LABEL, "primary"),
            )
            .await;
        store
            .insert_pod(
                PodRecord::new("valkey-1", Some("10.0.0.2"))
                    .with_label(CLUSTER_LABEL, "demo")
                    .with_label(ROLE_LABEL, "replica"),
            )
            .await;
        store
            .insert_pod(
                PodRecord::new("other-0", Some("10.0.1.1"))
                    .with_label(CLUSTER_LABEL, "other")
                    .with_label(ROLE_LABEL, "primary"),
            )
            .await;

        let primaries = store.list(&LabelSelector::primary_of("demo")).await.unwrap();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].name, "valkey-0");
    }

    #[tokio::test]
    async fn test_update_labels_sets_and_removes() {
        let store = InMemoryMetadataStore::new();
        store
            .insert_pod(PodRecord::new("valkey-0", Some("10.0.0.1")).with_label(ROLE_LABEL, "primary"))
            .await;

        let mut delta = LabelDelta::new();
        delta.insert(CLUSTER_LABEL.to_string(), Some("demo".to_string()));
        delta.insert(ROLE_LABEL.to_string(), None);
        store.update_labels("valkey-0", &delta).await.unwrap();

        let pod = store.get("valkey-0").await.unwrap();
        assert_eq!(pod.label(CLUSTER_LABEL), Some("demo"));
        assert_eq!(pod.label(ROLE_LABEL), None);
    }

    #[tokio::test]
    async fn test_missing_pod_and_unavailable_store() {
        let store = InMemoryMetadataStore::new();
        let err = store.get("ghost").await.unwrap_err();
        assert!(matches!(err, LeaderError::PodNotFound { .. }));

        store.set_unavailable(true);
        let err = store.list(&LabelSelector::new()).await.unwrap_err();
        assert!(matches!(err, LeaderError::MetadataStore(_)));

        store.set_unavailable(false);
        assert!(store.list(&LabelSelector::new()).await.unwrap().is_empty());
    }
}
