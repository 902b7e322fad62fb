use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label carrying the cluster a pod belongs to
pub const CLUSTER_LABEL: &str = "valkey.sapslaj.cloud/cluster";
/// Label carrying the published instance role
pub const ROLE_LABEL: &str = "valkey.sapslaj.cloud/instance-role";

/// Replication role of a data-store instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Unknown,
    Primary,
    Replica,
}

impl Role {
    /// Label value for this role. `Unknown` is never written to the store.
    pub fn label_value(&self) -> Option<&'static str> {
        match self {
            Role::Unknown => None,
            Role::Primary => Some("primary"),
            Role::Replica => Some("replica"),
        }
    }

    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("primary") => Role::Primary,
            Some("replica") => Role::Replica,
            _ => Role::Unknown,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value().unwrap_or("unknown"))
    }
}

/// Identity of the node this agent runs on. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Network address (pod IP); doubles as the lease holder identity
    pub address: String,
    /// Human-readable name (pod name)
    pub name: String,
}

impl NodeIdentity {
    pub fn new<A: Into<String>, N: Into<String>>(address: A, name: N) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.address)
    }
}

/// Equality-based label selector, rendered as `k1=v1,k2=v2`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.terms.insert(key.into(), value.into());
        self
    }

    /// Selector for pods published as primary in the given cluster
    pub fn primary_of(cluster_name: &str) -> Self {
        Self::new()
            .with(CLUSTER_LABEL, cluster_name)
            .with(ROLE_LABEL, "primary")
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .terms
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        f.write_str(&rendered.join(","))
    }
}
