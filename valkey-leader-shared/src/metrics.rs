use metrics::{counter, describe_counter, describe_gauge, gauge, with_local_recorder, Counter, Gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Reconciliation counters, labeled with the cluster and pod they describe.
///
/// Handles are bound to whichever recorder is installed when [`ReconcileMetrics::new`]
/// runs, so the binary installs its Prometheus recorder first.
#[derive(Clone)]
pub struct ReconcileMetrics {
    promotions: Counter,
    replications: Counter,
    publishes: Counter,
    instance_failures: Counter,
    store_failures: Counter,
    discovery_misses: Counter,
    self_discovery_skips: Counter,
    tick_timeouts: Counter,
    elections_won: Counter,
    demotions: Counter,
    is_leader: Gauge,
}

impl ReconcileMetrics {
    pub fn new(cluster_name: &str, pod_name: &str) -> Self {
        describe();

        let labels = [
            ("cluster", cluster_name.to_string()),
            ("pod", pod_name.to_string()),
        ];
        Self {
            promotions: counter!("valkey_leader_promotions_total", &labels),
            replications: counter!("valkey_leader_replications_total", &labels),
            publishes: counter!("valkey_leader_role_publishes_total", &labels),
            instance_failures: counter!("valkey_leader_instance_failures_total", &labels),
            store_failures: counter!("valkey_leader_store_failures_total", &labels),
            discovery_misses: counter!("valkey_leader_discovery_misses_total", &labels),
            self_discovery_skips: counter!("valkey_leader_self_discovery_skips_total", &labels),
            tick_timeouts: counter!("valkey_leader_tick_timeouts_total", &labels),
            elections_won: counter!("valkey_leader_elections_won_total", &labels),
            demotions: counter!("valkey_leader_demotions_total", &labels),
            is_leader: gauge!("valkey_leader_is_leader", &labels),
        }
    }

    /// Metrics backed by a private Prometheus registry instead of the global recorder.
    ///
    /// Lets several simulated nodes share a process without mixing their series.
    pub fn isolated(cluster_name: &str, pod_name: &str) -> (Self, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = with_local_recorder(&recorder, || Self::new(cluster_name, pod_name));
        (metrics, handle)
    }

    pub fn record_promotion(&self) {
        self.promotions.increment(1);
    }

    pub fn record_replication(&self) {
        self.replications.increment(1);
    }

    pub fn record_publish(&self) {
        self.publishes.increment(1);
    }

    pub fn record_instance_failure(&self) {
        self.instance_failures.increment(1);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.increment(1);
    }

    pub fn record_discovery_miss(&self) {
        self.discovery_misses.increment(1);
    }

    pub fn record_self_discovery(&self) {
        self.self_discovery_skips.increment(1);
    }

    pub fn record_tick_timeout(&self) {
        self.tick_timeouts.increment(1);
    }

    pub fn record_election_won(&self) {
        self.elections_won.increment(1);
        self.is_leader.set(1.0);
    }

    pub fn record_demotion(&self) {
        self.demotions.increment(1);
        self.is_leader.set(0.0);
    }
}

fn describe() {
    describe_counter!("valkey_leader_promotions_total", "Successful promote-to-primary commands");
    describe_counter!("valkey_leader_replications_total", "Successful replicate-from commands");
    describe_counter!("valkey_leader_role_publishes_total", "Role labels written");
    describe_counter!("valkey_leader_instance_failures_total", "Failed instance commands");
    describe_counter!("valkey_leader_store_failures_total", "Failed metadata store calls");
    describe_counter!(
        "valkey_leader_discovery_misses_total",
        "Ticks without a discoverable primary"
    );
    describe_counter!(
        "valkey_leader_self_discovery_skips_total",
        "Ticks that discovered this node as primary"
    );
    describe_counter!(
        "valkey_leader_tick_timeouts_total",
        "Reconciliation passes abandoned for taking longer than the cadence"
    );
    describe_counter!("valkey_leader_elections_won_total", "Leases acquired");
    describe_counter!("valkey_leader_demotions_total", "Leases lost or given up");
    describe_gauge!("valkey_leader_is_leader", "Whether this pod holds the lease");
}

/// Value of the first sample of `name` in a Prometheus text exposition.
#[cfg(test)]
pub(crate) fn sample(rendered: &str, name: &str) -> Option<f64> {
    rendered
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find(|line| line.starts_with(&format!("{}{{", name)) || line.starts_with(&format!("{} ", name)))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}
