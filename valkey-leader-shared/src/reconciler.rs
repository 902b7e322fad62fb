//! Role reconciliation.
//!
//! The reconciler is a three-state machine (`Unelected`, `Leading`, `Following`) driven
//! by election callbacks and a fixed cadence:
//!
//! * while leading, every tick promotes the local instance and then labels it primary;
//! * while not leading, every tick looks up the labeled primary, replicates from it and
//!   then labels the local instance replica.
//!
//! There is no backoff beyond the cadence. A failed tick changes nothing and the next
//! tick tries again, so the last successfully published role stays in place. A pass
//! that outlives the cadence interval is abandoned, and shutdown interrupts any pass
//! in flight.

use crate::discovery::PrimaryDiscovery;
use crate::election::{ElectionCallbacks, LeadershipFlag};
use crate::exception::LeaderResult;
use crate::instance::InstanceControl;
use crate::labeler::RoleLabeler;
use crate::metrics::ReconcileMetrics;
use crate::role::{NodeIdentity, Role};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Reconciler tuning
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub cluster_name: String,
    /// Cadence tick
    pub interval: Duration,
    /// Remove the role label when shutting down
    pub deregister_on_shutdown: bool,
    /// Upper bound for the label withdrawal at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "valkey".to_string(),
            interval: Duration::from_secs(15),
            deregister_on_shutdown: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerState {
    Unelected,
    Leading,
    Following,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerEvent {
    Elected,
    Demoted,
    FollowTick,
    Cancelled,
}

impl ReconcilerState {
    pub fn next(self, event: ReconcilerEvent) -> Self {
        use ReconcilerEvent::*;
        use ReconcilerState::*;

        match (self, event) {
            (Terminated, _) | (_, Cancelled) => Terminated,
            (_, Elected) => Leading,
            (Leading, Demoted) => Unelected,
            (state, Demoted) => state,
            (Leading, FollowTick) => Leading,
            (_, FollowTick) => Following,
        }
    }
}

/// What a single reconciliation pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The pass does not apply to the current leadership (e.g. a follow tick while leading)
    NotApplicable,
    NoPrimary,
    /// Discovery returned this node's own address
    SelfIsPrimary,
    InstanceFailed,
    StoreFailed,
    /// The pass ran longer than one cadence interval and was abandoned
    TimedOut,
    Published(Role),
}

/// Snapshot served to operators
#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    pub cluster: String,
    pub pod: String,
    pub address: String,
    pub state: ReconcilerState,
    pub leader: bool,
    pub role: Role,
    pub observed_leader: Option<String>,
    /// Role label as currently stored, when it has been read back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labeled_role: Option<Role>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LeadingTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct ReconcilerCore {
    identity: NodeIdentity,
    config: ReconcilerConfig,
    instance: Arc<dyn InstanceControl>,
    labeler: RoleLabeler,
    discovery: PrimaryDiscovery,
    flag: Arc<LeadershipFlag>,
    metrics: Arc<ReconcileMetrics>,
    shutdown: CancellationToken,
    state: Mutex<ReconcilerState>,
    published: Mutex<Role>,
    observed_leader: Mutex<Option<String>>,
    // Serializes ticks so a follow pass never interleaves with a promote.
    tick_lock: tokio::sync::Mutex<()>,
}

impl ReconcilerCore {
    fn transition(&self, event: ReconcilerEvent) -> ReconcilerState {
        let mut state = lock(&self.state);
        let next = state.next(event);
        if next != *state {
            debug!(from = ?*state, to = ?next, ?event, "reconciler transition");
            *state = next;
        }
        next
    }

    async fn lead(self: Arc<Self>, stop: CancellationToken) {
        info!("starting primary reconciliation");
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if stop.is_cancelled() || !self.flag.is_leader() {
                break;
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.lead_tick() => {}
            }
        }

        info!("stopped primary reconciliation");
    }

    /// Run one pass, giving up once it exceeds the cadence interval.
    async fn bounded<F: Future<Output = TickOutcome>>(&self, pass: F) -> TickOutcome {
        match tokio::time::timeout(self.config.interval, pass).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(interval = ?self.config.interval, "reconciliation pass timed out");
                self.metrics.record_tick_timeout();
                TickOutcome::TimedOut
            }
        }
    }

    async fn lead_tick(&self) -> TickOutcome {
        self.bounded(self.lead_pass()).await
    }

    async fn follow_tick(&self) -> TickOutcome {
        self.bounded(self.follow_pass()).await
    }

    async fn lead_pass(&self) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;
        if !self.flag.is_leader() {
            return TickOutcome::NotApplicable;
        }

        if let Err(e) = self.instance.promote_to_primary().await {
            error!(error = %e, "failed to promote to primary");
            self.metrics.record_instance_failure();
            return TickOutcome::InstanceFailed;
        }
        self.metrics.record_promotion();
        info!("promoted to primary");

        self.publish(Role::Primary).await
    }

    async fn follow_pass(&self) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;
        if self.flag.is_leader() {
            return TickOutcome::NotApplicable;
        }
        self.transition(ReconcilerEvent::FollowTick);

        let hint = lock(&self.observed_leader).clone();
        let primary = match self
            .discovery
            .find_primary_preferring(&self.config.cluster_name, hint.as_deref())
            .await
        {
            Ok(Some(primary)) => primary,
            Ok(None) => {
                warn!(
                    interval = ?self.config.interval,
                    "no primary pod found, retrying next tick"
                );
                self.metrics.record_discovery_miss();
                return TickOutcome::NoPrimary;
            }
            Err(e) => {
                error!(error = %e, "failed to list pods");
                self.metrics.record_store_failure();
                return TickOutcome::StoreFailed;
            }
        };

        if primary.address == self.identity.address {
            info!(primary_pod = %primary.pod_name, "discovered primary is this node, skipping replication");
            self.metrics.record_self_discovery();
            return TickOutcome::SelfIsPrimary;
        }

        info!(
            primary_pod = %primary.pod_name,
            primary_ip = %primary.address,
            "found primary pod"
        );

        if let Err(e) = self.instance.replicate_from(&primary.address).await {
            error!(error = %e, primary_ip = %primary.address, "failed to configure replication");
            self.metrics.record_instance_failure();
            return TickOutcome::InstanceFailed;
        }
        self.metrics.record_replication();
        info!(primary_ip = %primary.address, "configured replication");

        self.publish(Role::Replica).await
    }

    async fn publish(&self, role: Role) -> TickOutcome {
        match self.labeler.publish_role(role).await {
            Ok(()) => {
                *lock(&self.published) = role;
                self.metrics.record_publish();
                info!(%role, "updated pod role label");
                TickOutcome::Published(role)
            }
            Err(e) => {
                error!(error = %e, %role, "failed to update pod labels");
                self.metrics.record_store_failure();
                TickOutcome::StoreFailed
            }
        }
    }
}

/// Keeps the local instance's role in line with the election outcome
pub struct RoleReconciler {
    core: Arc<ReconcilerCore>,
    leading: Mutex<Option<LeadingTask>>,
}

impl RoleReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: NodeIdentity,
        config: ReconcilerConfig,
        instance: Arc<dyn InstanceControl>,
        labeler: RoleLabeler,
        discovery: PrimaryDiscovery,
        flag: Arc<LeadershipFlag>,
        metrics: Arc<ReconcileMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            core: Arc::new(ReconcilerCore {
                identity,
                config,
                instance,
                labeler,
                discovery,
                flag,
                metrics,
                shutdown,
                state: Mutex::new(ReconcilerState::Unelected),
                published: Mutex::new(Role::Unknown),
                observed_leader: Mutex::new(None),
                tick_lock: tokio::sync::Mutex::new(()),
            }),
            leading: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        *lock(&self.core.state)
    }

    /// Role most recently published by this process; `Unknown` until the first success.
    pub fn published_role(&self) -> Role {
        *lock(&self.core.published)
    }

    /// Ready once a role has been published.
    pub fn is_ready(&self) -> bool {
        self.published_role() != Role::Unknown
    }

    pub fn is_leader(&self) -> bool {
        self.core.flag.is_leader()
    }

    pub fn status(&self) -> RoleStatus {
        RoleStatus {
            cluster: self.core.config.cluster_name.clone(),
            pod: self.core.identity.name.clone(),
            address: self.core.identity.address.clone(),
            state: self.state(),
            leader: self.is_leader(),
            role: self.published_role(),
            observed_leader: lock(&self.core.observed_leader).clone(),
            labeled_role: None,
        }
    }

    /// Read this pod's role label back from the metadata store.
    pub async fn labeled_role(&self) -> LeaderResult<Role> {
        self.core.labeler.current_role().await
    }

    /// One leading pass: promote, then publish primary. Bounded by the cadence interval.
    pub async fn lead_tick(&self) -> TickOutcome {
        self.core.lead_tick().await
    }

    /// One following pass: discover, replicate, then publish replica.
    pub async fn follow_tick(&self) -> TickOutcome {
        self.core.follow_tick().await
    }

    /// Run the following loop until shutdown. It idles through ticks while leading.
    pub async fn run(&self) {
        info!(
            cluster_name = %self.core.config.cluster_name,
            interval = ?self.core.config.interval,
            "starting replica reconciliation"
        );
        let mut ticker = interval(self.core.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.core.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = self.core.shutdown.cancelled() => break,
                _ = self.core.follow_tick() => {}
            }
        }

        self.core.transition(ReconcilerEvent::Cancelled);
        info!("context canceled, stopped replica reconciliation");
    }

    /// Wait for the leading loop to stop and withdraw the role label if configured.
    pub async fn shutdown(&self) {
        self.core.transition(ReconcilerEvent::Cancelled);

        let task = lock(&self.leading).take();
        if let Some(task) = task {
            task.stop.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "leading loop ended abnormally");
            }
        }

        if self.core.config.deregister_on_shutdown {
            let withdrawal = tokio::time::timeout(
                self.core.config.shutdown_timeout,
                self.core.labeler.withdraw_role(),
            );
            match withdrawal.await {
                Ok(Ok(())) => info!("removed role label"),
                Ok(Err(e)) => warn!(error = %e, "failed to remove role label"),
                Err(_) => warn!(
                    timeout = ?self.core.config.shutdown_timeout,
                    "timed out removing role label"
                ),
            }
        }
    }
}

impl ElectionCallbacks for RoleReconciler {
    fn on_elected(&self) {
        self.core.transition(ReconcilerEvent::Elected);
        self.core.metrics.record_election_won();

        let mut leading = lock(&self.leading);
        if leading.as_ref().is_some_and(|task| !task.stop.is_cancelled()) {
            return;
        }
        if self.core.shutdown.is_cancelled() {
            return;
        }

        let stop = self.core.shutdown.child_token();
        let handle = tokio::spawn(self.core.clone().lead(stop.clone()).in_current_span());
        *leading = Some(LeadingTask { stop, handle });
    }

    fn on_demoted(&self) {
        self.core.transition(ReconcilerEvent::Demoted);
        self.core.metrics.record_demotion();

        if let Some(task) = lock(&self.leading).as_ref() {
            task.stop.cancel();
        }
        info!("leader lost");
    }

    fn on_observed_leader(&self, identity: &str) {
        *lock(&self.core.observed_leader) = Some(identity.to_string());
    }
}
