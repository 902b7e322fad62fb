use crate::exception::{LeaderError, LeaderResult};
use crate::metadata::{LabelDelta, MetadataStore};
use crate::role::{Role, CLUSTER_LABEL, ROLE_LABEL};
use std::sync::Arc;
use tracing::debug;

/// Publishes this node's role as a label on its own pod
#[derive(Clone)]
pub struct RoleLabeler {
    store: Arc<dyn MetadataStore>,
    pod_name: String,
    cluster_name: String,
}

impl RoleLabeler {
    pub fn new<P: Into<String>, C: Into<String>>(
        store: Arc<dyn MetadataStore>,
        pod_name: P,
        cluster_name: C,
    ) -> Self {
        Self {
            store,
            pod_name: pod_name.into(),
            cluster_name: cluster_name.into(),
        }
    }

    /// Tag the pod with its cluster so discovery can scope its queries.
    pub async fn join_cluster(&self) -> LeaderResult<()> {
        // Fails fast with PodNotFound when the pod identity is wrong.
        self.store.get(&self.pod_name).await?;
        let mut delta = LabelDelta::new();
        delta.insert(CLUSTER_LABEL.to_string(), Some(self.cluster_name.clone()));
        self.store.update_labels(&self.pod_name, &delta).await?;
        debug!(pod_name = %self.pod_name, cluster_name = %self.cluster_name, "joined cluster");
        Ok(())
    }

    /// Overwrite the role label. Must only follow a successful instance command.
    pub async fn publish_role(&self, role: Role) -> LeaderResult<()> {
        let value = role
            .label_value()
            .ok_or_else(|| LeaderError::internal("refusing to publish an unknown role"))?;

        let mut delta = LabelDelta::new();
        delta.insert(ROLE_LABEL.to_string(), Some(value.to_string()));
        self.store.update_labels(&self.pod_name, &delta).await
    }

    /// Role currently published for this pod
    pub async fn current_role(&self) -> LeaderResult<Role> {
        let pod = self.store.get(&self.pod_name).await?;
        Ok(Role::from_label(pod.label(ROLE_LABEL)))
    }

    /// Remove the role label so routing stops targeting this pod.
    pub async fn withdraw_role(&self) -> LeaderResult<()> {
        let mut delta = LabelDelta::new();
        delta.insert(ROLE_LABEL.to_string(), None);
        self.store.update_labels(&self.pod_name, &delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InMemoryMetadataStore, PodRecord};

    async fn labeler_with_pod() -> (Arc<InMemoryMetadataStore>, RoleLabeler) {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.insert_pod(PodRecord::new("valkey-0", Some("10.0.0.1"))).await;
        let labeler = RoleLabeler::new(store.clone(), "valkey-0", "demo");
        (store, labeler)
    }

    #[tokio::test]
    async fn test_join_cluster_sets_cluster_label() {
        let (store, labeler) = labeler_with_pod().await;
        labeler.join_cluster().await.unwrap();

        let pod = store.get("valkey-0").await.unwrap();
        assert_eq!(pod.label(CLUSTER_LABEL), Some("demo"));
    }

    #[tokio::test]
    async fn test_join_cluster_unknown_pod_fails() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let labeler = RoleLabeler::new(store, "missing", "demo");
        let err = labeler.join_cluster().await.unwrap_err();
        assert!(matches!(err, LeaderError::PodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_publish_and_read_back() {
        let (_store, labeler) = labeler_with_pod().await;
        assert_eq!(labeler.current_role().await.unwrap(), Role::Unknown);

        labeler.publish_role(Role::Primary).await.unwrap();
        assert_eq!(labeler.current_role().await.unwrap(), Role::Primary);

        labeler.publish_role(Role::Replica).await.unwrap();
        assert_eq!(labeler.current_role().await.unwrap(), Role::Replica);

        assert!(labeler.publish_role(Role::Unknown).await.is_err());
        assert_eq!(labeler.current_role().await.unwrap(), Role::Replica);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_label() {
        let (store, labeler) = labeler_with_pod().await;
        labeler.publish_role(Role::Replica).await.unwrap();

        store.set_unavailable(true);
        assert!(labeler.publish_role(Role::Primary).await.is_err());
        store.set_unavailable(false);

        assert_eq!(labeler.current_role().await.unwrap(), Role::Replica);
    }

    #[tokio::test]
    async fn test_withdraw_role() {
        let (_store, labeler) = labeler_with_pod().await;
        labeler.publish_role(Role::Primary).await.unwrap();
        labeler.withdraw_role().await.unwrap();
        assert_eq!(labeler.current_role().await.unwrap(), Role::Unknown);
    }
}
