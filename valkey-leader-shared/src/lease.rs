use crate::exception::{LeaderError, LeaderResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Lease contents as seen by the elector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder; `None` once released
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub leader_transitions: i32,
    /// Opaque store version used for optimistic concurrency
    pub version: Option<String>,
}

impl LeaseRecord {
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|holder| !holder.is_empty())
    }
}

/// Storage for a single named lease.
///
/// `create` fails with a conflict when the lease already exists; `update` fails with
/// a conflict when the record's version no longer matches the stored one.
///
/// `acquire_time` and `renew_time` are informational. Expiry is decided by the reader
/// from how long the record has stayed unchanged on its own clock.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self) -> LeaderResult<Option<LeaseRecord>>;
    async fn create(&self, record: &LeaseRecord) -> LeaderResult<LeaseRecord>;
    async fn update(&self, record: &LeaseRecord) -> LeaderResult<LeaseRecord>;
    fn describe(&self) -> String;
}

/// `coordination.k8s.io/v1` Lease backed store
pub struct KubeLeaseStore {
    leases: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_record(lease: &Lease) -> LeaseRecord {
        let spec = lease.spec.clone().unwrap_or_default();
        LeaseRecord {
            holder_identity: spec.holder_identity,
            lease_duration: Duration::from_secs(
                spec.lease_duration_seconds.unwrap_or_default().max(0) as u64,
            ),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            leader_transitions: spec.lease_transitions.unwrap_or_default(),
            version: lease.metadata.resource_version.clone(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.leader_transitions),
                ..Default::default()
            }),
        }
    }

    fn map_conflict(&self, err: kube::Error) -> LeaderError {
        match err {
            kube::Error::Api(response) if response.code == 409 => {
                LeaderError::lease_conflict(format!("{}: {}", self.describe(), response.message))
            }
            other => other.into(),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> LeaderResult<Option<LeaseRecord>> {
        let lease = self.leases.get_opt(&self.name).await?;
        Ok(lease.as_ref().map(Self::to_record))
    }

    async fn create(&self, record: &LeaseRecord) -> LeaderResult<LeaseRecord> {
        debug!(lease = %self.describe(), holder = ?record.holder_identity, "creating lease");
        let mut lease = self.to_lease(record);
        lease.metadata.resource_version = None;
        let created = self
            .leases
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| self.map_conflict(e))?;
        Ok(Self::to_record(&created))
    }

    async fn update(&self, record: &LeaseRecord) -> LeaderResult<LeaseRecord> {
        let lease = self.to_lease(record);
        let replaced = self
            .leases
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(|e| self.map_conflict(e))?;
        Ok(Self::to_record(&replaced))
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// In-process lease shared between electors in tests
pub struct InMemoryLeaseStore {
    name: String,
    lease: Mutex<Option<LeaseRecord>>,
    next_version: Mutex<u64>,
}

impl InMemoryLeaseStore {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            lease: Mutex::new(None),
            next_version: Mutex::new(1),
        }
    }

    /// Overwrite the stored lease, bypassing version checks.
    pub async fn force(&self, record: Option<LeaseRecord>) {
        let mut lease = self.lease.lock().await;
        *lease = match record {
            Some(mut record) => {
                record.version = Some(self.bump().await);
                Some(record)
            }
            None => None,
        };
    }

    async fn bump(&self) -> String {
        let mut next = self.next_version.lock().await;
        let version = next.to_string();
        *next += 1;
        version
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self) -> LeaderResult<Option<LeaseRecord>> {
        Ok(self.lease.lock().await.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> LeaderResult<LeaseRecord> {
        let mut lease = self.lease.lock().await;
        if lease.is_some() {
            return Err(LeaderError::lease_conflict(format!("{} already exists", self.name)));
        }

        let mut stored = record.clone();
        stored.version = Some(self.bump().await);
        *lease = Some(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> LeaderResult<LeaseRecord> {
        let mut lease = self.lease.lock().await;
        let current = lease
            .as_ref()
            .ok_or_else(|| LeaderError::lease(format!("{} not found", self.name)))?;

        if current.version != record.version {
            return Err(LeaderError::lease_conflict(format!(
                "{} version {:?} is stale, store has {:?}",
                self.name, record.version, current.version
            )));
        }

        let mut stored = record.clone();
        stored.version = Some(self.bump().await);
        *lease = Some(stored.clone());
        Ok(stored)
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.name)
    }
}
