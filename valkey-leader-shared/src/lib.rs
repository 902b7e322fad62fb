//! # Valkey Leader Shared
//!
//! Building blocks for keeping a set of Valkey pods in a single-primary topology:
//!
//! - **Election**: lease-based leader election over a pluggable [`LeaseStore`]
//! - **Instance control**: `REPLICAOF` commands against the local instance
//! - **Discovery**: finding the pod currently labeled primary
//! - **Labeling**: publishing this pod's role for Services to select on
//! - **Reconciliation**: the loop tying the above together
//!
//! Every external system sits behind a trait with an in-memory implementation,
//! so whole clusters can be simulated in one process.

pub mod discovery;
pub mod election;
pub mod exception;
pub mod instance;
pub mod labeler;
pub mod lease;
pub mod metadata;
pub mod metrics;
pub mod reconciler;
pub mod role;

pub use discovery::{PrimaryDiscovery, PrimaryEndpoint};
pub use election::{ElectionCallbacks, ElectionConfig, LeaderElector, LeadershipFlag};
pub use exception::*;
pub use instance::{InstanceCommand, InstanceControl, InstanceState, RecordingInstance, ValkeyInstance};
pub use labeler::RoleLabeler;
pub use lease::{InMemoryLeaseStore, KubeLeaseStore, LeaseRecord, LeaseStore};
pub use metadata::{InMemoryMetadataStore, KubePodStore, LabelDelta, MetadataStore, PodRecord};
pub use self::metrics::ReconcileMetrics;
pub use reconciler::{
    ReconcilerConfig, ReconcilerEvent, ReconcilerState, RoleReconciler, RoleStatus, TickOutcome,
};
pub use role::{LabelSelector, NodeIdentity, Role, CLUSTER_LABEL, ROLE_LABEL};
