use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use valkey_leader_shared::{
    ElectionCallbacks, ElectionConfig, InMemoryLeaseStore, InMemoryMetadataStore, InstanceCommand,
    InstanceState, LabelSelector, LeaderElector, LeadershipFlag, LeaseStore, MetadataStore,
    NodeIdentity, PodRecord, PrimaryDiscovery, ReconcileMetrics, ReconcilerConfig,
    RecordingInstance, Role, RoleLabeler, RoleReconciler, TickOutcome, CLUSTER_LABEL, ROLE_LABEL,
};

const CLUSTER: &str = "demo";

/// One simulated pod: its instance, leader flag and reconciler
struct TestNode {
    name: String,
    address: String,
    instance: Arc<RecordingInstance>,
    flag: Arc<LeadershipFlag>,
    shutdown: CancellationToken,
    reconciler: Arc<RoleReconciler>,
    metrics: PrometheusHandle,
}

impl TestNode {
    fn new(name: &str, address: &str, store: Arc<InMemoryMetadataStore>) -> Self {
        let instance = Arc::new(RecordingInstance::new());
        let flag = Arc::new(LeadershipFlag::new());
        let shutdown = CancellationToken::new();
        let config = ReconcilerConfig {
            cluster_name: CLUSTER.to_string(),
            interval: Duration::from_secs(15),
            deregister_on_shutdown: true,
            shutdown_timeout: Duration::from_secs(5),
        };
        let (metrics, handle) = ReconcileMetrics::isolated(CLUSTER, name);

        let reconciler = Arc::new(RoleReconciler::new(
            NodeIdentity::new(address, name),
            config,
            instance.clone(),
            RoleLabeler::new(store.clone(), name, CLUSTER),
            PrimaryDiscovery::new(store),
            flag.clone(),
            Arc::new(metrics),
            shutdown.clone(),
        ));

        Self {
            name: name.to_string(),
            address: address.to_string(),
            instance,
            flag,
            shutdown,
            reconciler,
            metrics: handle,
        }
    }

    /// Current value of one of this node's counters
    fn counter(&self, name: &str) -> f64 {
        self.metrics
            .render()
            .lines()
            .find(|line| line.starts_with(&format!("{}{{", name)))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0.0)
    }
}

/// Nodes sharing one metadata store
struct TestCluster {
    store: Arc<InMemoryMetadataStore>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    async fn new(members: &[(&str, &str)]) -> Self {
        let store = Arc::new(InMemoryMetadataStore::new());
        let mut nodes = Vec::new();

        for (name, address) in members {
            store
                .insert_pod(PodRecord::new(*name, Some(*address)).with_label(CLUSTER_LABEL, CLUSTER))
                .await;
            nodes.push(TestNode::new(name, address, store.clone()));
        }

        Self { store, nodes }
    }

    fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .expect("unknown test node")
    }

    async fn role_of(&self, name: &str) -> Role {
        let pod = self.store.get(name).await.unwrap();
        Role::from_label(pod.label(ROLE_LABEL))
    }

    async fn primaries(&self) -> Vec<String> {
        self.store
            .list(&LabelSelector::primary_of(CLUSTER))
            .await
            .unwrap()
            .into_iter()
            .map(|pod| pod.name)
            .collect()
    }
}

#[tokio::test]
async fn scenario_a_leader_promotes_and_followers_replicate() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")]).await;
    let a = cluster.node("a");
    a.flag.set(true);

    assert_eq!(a.reconciler.lead_tick().await, TickOutcome::Published(Role::Primary));
    assert_eq!(cluster.role_of("a").await, Role::Primary);

    for name in ["b", "c"] {
        let node = cluster.node(name);
        assert_eq!(node.reconciler.follow_tick().await, TickOutcome::Published(Role::Replica));
        assert_eq!(
            node.instance.commands().await,
            vec![InstanceCommand::ReplicateFrom("10.0.0.1".to_string())]
        );
        assert_eq!(cluster.role_of(name).await, Role::Replica);
    }

    assert_eq!(cluster.primaries().await, vec!["a".to_string()]);
}

#[tokio::test]
async fn scenario_b_failover_moves_replication_to_new_leader() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")]).await;
    let (a, b, c) = (cluster.node("a"), cluster.node("b"), cluster.node("c"));

    a.flag.set(true);
    a.reconciler.lead_tick().await;
    b.reconciler.follow_tick().await;
    c.reconciler.follow_tick().await;

    // a loses the lease, b wins it.
    a.flag.set(false);
    a.reconciler.on_demoted();
    b.flag.set(true);
    b.reconciler.on_elected();
    for node in &cluster.nodes {
        node.reconciler.on_observed_leader(&b.address);
    }

    assert_eq!(a.reconciler.lead_tick().await, TickOutcome::NotApplicable);
    assert_eq!(a.instance.commands().await, vec![InstanceCommand::Promote]);

    assert_eq!(b.reconciler.lead_tick().await, TickOutcome::Published(Role::Primary));
    assert_eq!(b.instance.state().await, InstanceState::Primary);

    // a's label is stale for now; the observed leader breaks the tie.
    assert_eq!(cluster.primaries().await.len(), 2);
    assert_eq!(c.reconciler.follow_tick().await, TickOutcome::Published(Role::Replica));
    assert_eq!(c.instance.state().await, InstanceState::ReplicaOf("10.0.0.2".to_string()));

    assert_eq!(a.reconciler.follow_tick().await, TickOutcome::Published(Role::Replica));
    assert_eq!(a.instance.state().await, InstanceState::ReplicaOf("10.0.0.2".to_string()));

    assert_eq!(cluster.primaries().await, vec!["b".to_string()]);

    b.shutdown.cancel();
    b.reconciler.shutdown().await;
}

#[tokio::test]
async fn demoted_node_seeing_only_itself_skips_replication() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]).await;
    let a = cluster.node("a");

    a.flag.set(true);
    a.reconciler.lead_tick().await;
    a.flag.set(false);

    assert_eq!(a.reconciler.follow_tick().await, TickOutcome::SelfIsPrimary);
    assert_eq!(a.instance.commands().await, vec![InstanceCommand::Promote]);
    assert_eq!(cluster.role_of("a").await, Role::Primary);
}

#[tokio::test]
async fn scenario_c_no_primary_means_no_instance_call() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")]).await;

    for node in &cluster.nodes {
        assert_eq!(node.reconciler.follow_tick().await, TickOutcome::NoPrimary);
        assert!(node.instance.commands().await.is_empty());
        assert_eq!(node.counter("valkey_leader_discovery_misses_total"), 1.0);
    }
    assert!(cluster.primaries().await.is_empty());
}

#[tokio::test]
async fn failed_replication_keeps_last_published_role() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]).await;
    let (a, b) = (cluster.node("a"), cluster.node("b"));

    a.flag.set(true);
    a.reconciler.lead_tick().await;
    assert_eq!(b.reconciler.follow_tick().await, TickOutcome::Published(Role::Replica));

    b.instance.set_failing(true);
    assert_eq!(b.reconciler.follow_tick().await, TickOutcome::InstanceFailed);
    assert_eq!(cluster.role_of("b").await, Role::Replica);
    assert_eq!(b.reconciler.published_role(), Role::Replica);

    b.instance.set_failing(false);
    assert_eq!(b.reconciler.follow_tick().await, TickOutcome::Published(Role::Replica));
}

#[tokio::test]
async fn metadata_outage_changes_no_labels() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2")]).await;
    let (a, b) = (cluster.node("a"), cluster.node("b"));

    a.flag.set(true);
    a.reconciler.lead_tick().await;
    b.reconciler.follow_tick().await;

    cluster.store.set_unavailable(true);
    assert_eq!(a.reconciler.lead_tick().await, TickOutcome::StoreFailed);
    assert_eq!(b.reconciler.follow_tick().await, TickOutcome::StoreFailed);
    cluster.store.set_unavailable(false);

    assert_eq!(cluster.role_of("a").await, Role::Primary);
    assert_eq!(cluster.role_of("b").await, Role::Replica);
}

#[tokio::test]
async fn repeated_promotion_is_idempotent() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1")]).await;
    let a = cluster.node("a");
    a.flag.set(true);

    assert_eq!(a.reconciler.lead_tick().await, TickOutcome::Published(Role::Primary));
    let state = a.instance.state().await;
    assert_eq!(a.reconciler.lead_tick().await, TickOutcome::Published(Role::Primary));

    assert_eq!(a.instance.state().await, state);
    assert_eq!(cluster.primaries().await, vec!["a".to_string()]);
}

/// A node with its elector and loops running
struct RunningNode {
    elector: JoinHandle<()>,
    follower: JoinHandle<()>,
}

fn start(node: &TestNode, leases: Arc<InMemoryLeaseStore>) -> RunningNode {
    let config = ElectionConfig {
        lease_name: CLUSTER.to_string(),
        namespace: "default".to_string(),
        identity: node.address.clone(),
        ..Default::default()
    };
    let callbacks: Arc<dyn ElectionCallbacks> = node.reconciler.clone();
    let elector = Arc::new(LeaderElector::new(config, leases, node.flag.clone(), callbacks));

    let elector = tokio::spawn({
        let shutdown = node.shutdown.clone();
        async move { elector.run(shutdown).await }
    });
    let follower = tokio::spawn({
        let reconciler = node.reconciler.clone();
        async move { reconciler.run().await }
    });

    RunningNode { elector, follower }
}

async fn assert_converged(cluster: &TestCluster, members: &[&str]) -> String {
    let leaders: Vec<&TestNode> = members
        .iter()
        .map(|name| cluster.node(name))
        .filter(|node| node.flag.is_leader())
        .collect();
    assert_eq!(leaders.len(), 1, "exactly one node holds the lease");
    let leader = leaders[0];

    assert_eq!(cluster.primaries().await, vec![leader.name.clone()]);
    assert_eq!(leader.instance.state().await, InstanceState::Primary);

    for name in members.iter().filter(|name| **name != leader.name) {
        let node = cluster.node(name);
        assert_eq!(
            node.instance.state().await,
            InstanceState::ReplicaOf(leader.address.clone()),
            "{} replicates from the leader",
            name
        );
        assert_eq!(cluster.role_of(name).await, Role::Replica);
    }

    leader.name.clone()
}

#[tokio::test(start_paused = true)]
async fn cluster_converges_and_fails_over() {
    let cluster = TestCluster::new(&[("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")]).await;
    let leases = Arc::new(InMemoryLeaseStore::new(CLUSTER));

    let mut running: Vec<(String, RunningNode)> = cluster
        .nodes
        .iter()
        .map(|node| (node.name.clone(), start(node, leases.clone())))
        .collect();

    tokio::time::sleep(Duration::from_secs(40)).await;
    let first_leader = assert_converged(&cluster, &["a", "b", "c"]).await;

    // Shut the leader down; it releases the lease and withdraws its label.
    let index = running
        .iter()
        .position(|(name, _)| *name == first_leader)
        .unwrap();
    let (_, stopped) = running.remove(index);
    let leader_node = cluster.node(&first_leader);
    leader_node.shutdown.cancel();
    stopped.elector.await.unwrap();
    stopped.follower.await.unwrap();
    leader_node.reconciler.shutdown().await;

    assert_eq!(cluster.role_of(&first_leader).await, Role::Unknown);
    assert!(!leader_node.flag.is_leader());

    tokio::time::sleep(Duration::from_secs(40)).await;
    let survivors: Vec<&str> = ["a", "b", "c"]
        .into_iter()
        .filter(|name| *name != first_leader)
        .collect();
    let second_leader = assert_converged(&cluster, &survivors).await;
    assert_ne!(second_leader, first_leader);

    for (name, node) in running {
        cluster.node(&name).shutdown.cancel();
        node.elector.await.unwrap();
        node.follower.await.unwrap();
        cluster.node(&name).reconciler.shutdown().await;
    }
    let lease = leases.get().await.unwrap().unwrap();
    assert_eq!(lease.holder(), None);
}
