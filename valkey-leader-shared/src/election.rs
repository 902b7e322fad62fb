//! Lease-based leader election.
//!
//! [`LeaderElector`] drives any [`LeaseStore`] through the acquire / renew / release
//! cycle and reports transitions through [`ElectionCallbacks`]. Mutual exclusion comes
//! from the store's optimistic concurrency; the elector only decides when to try.
//!
//! Every store call is cut off by the renew deadline and abandoned on shutdown. A lease
//! held elsewhere counts as expired once it has gone `lease_duration` without changing,
//! timed on this node's clock, so holders' wall clocks never need to agree.

use crate::exception::{LeaderError, LeaderResult};
use crate::lease::{LeaseRecord, LeaseStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Leader election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Lease name, usually the cluster name
    pub lease_name: String,
    /// Namespace holding the lease
    pub namespace: String,
    /// Holder identity written into the lease (the pod IP)
    pub identity: String,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// A leader that cannot renew for this long steps down
    pub renew_deadline: Duration,
    /// Interval between acquire / renew attempts
    pub retry_period: Duration,
    /// Clear the holder on cancellation instead of waiting for expiry
    pub release_on_cancel: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: "valkey".to_string(),
            namespace: "default".to_string(),
            identity: String::new(),
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
            release_on_cancel: true,
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> LeaderResult<()> {
        if self.identity.is_empty() {
            return Err(LeaderError::configuration("election identity must not be empty"));
        }
        if self.lease_name.is_empty() {
            return Err(LeaderError::configuration("lease name must not be empty"));
        }
        if self.retry_period.is_zero() {
            return Err(LeaderError::configuration("retry period must be positive"));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(LeaderError::configuration(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(LeaderError::configuration(format!(
                "retry period {:?} must be shorter than renew deadline {:?}",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// "Am I leader" cell shared by the elector (writer) and the reconcile loops (readers)
#[derive(Debug, Default)]
pub struct LeadershipFlag {
    leading: AtomicBool,
}

impl LeadershipFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    pub fn set(&self, leading: bool) {
        self.leading.store(leading, Ordering::Release);
    }
}

/// Transition notifications. Called from the elector task; must not block.
pub trait ElectionCallbacks: Send + Sync {
    fn on_elected(&self);
    fn on_demoted(&self);
    fn on_observed_leader(&self, identity: &str);
}

/// A lease record and the local instant it was first seen in that exact state
struct Observation {
    record: LeaseRecord,
    at: Instant,
}

/// Runs the election loop for one node
pub struct LeaderElector {
    config: ElectionConfig,
    store: Arc<dyn LeaseStore>,
    flag: Arc<LeadershipFlag>,
    callbacks: Arc<dyn ElectionCallbacks>,
    observed_leader: RwLock<Option<String>>,
    observed_record: Mutex<Option<Observation>>,
}

impl LeaderElector {
    pub fn new(
        config: ElectionConfig,
        store: Arc<dyn LeaseStore>,
        flag: Arc<LeadershipFlag>,
        callbacks: Arc<dyn ElectionCallbacks>,
    ) -> Self {
        Self {
            config,
            store,
            flag,
            callbacks,
            observed_leader: RwLock::new(None),
            observed_record: Mutex::new(None),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.flag.is_leader()
    }

    /// Last lease holder this elector has seen
    pub async fn current_leader(&self) -> Option<String> {
        self.observed_leader.read().await.clone()
    }

    /// Campaign, lead, and campaign again after losing the lease, until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            lease = %self.store.describe(),
            identity = %self.config.identity,
            "starting leader election"
        );

        loop {
            if !self.acquire(&shutdown).await {
                break;
            }

            info!(identity = %self.config.identity, "successfully acquired lease");
            self.flag.set(true);
            self.callbacks.on_elected();

            let cancelled = self.renew(&shutdown).await;

            self.flag.set(false);
            self.callbacks.on_demoted();

            if cancelled {
                if self.config.release_on_cancel {
                    let limit = self.config.retry_period;
                    if tokio::time::timeout(limit, self.release()).await.is_err() {
                        warn!(?limit, "gave up releasing lease");
                    }
                }
                break;
            }
        }

        info!("leader election stopped");
    }

    /// Returns `false` when cancelled before winning the lease.
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.attempt(self.config.renew_deadline, shutdown).await {
                None => return false,
                Some(Ok(true)) => return true,
                Some(Ok(false)) => {}
                Some(Err(e)) if e.is_conflict() => debug!(error = %e, "lost lease race"),
                Some(Err(e)) => warn!(error = %e, "failed to acquire lease"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing. Returns `true` when cancelled, `false` when leadership was lost.
    async fn renew(&self, shutdown: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return true,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed());
            if remaining.is_zero() {
                self.log_deadline_exceeded();
                return false;
            }

            match self.attempt(remaining, shutdown).await {
                None => return true,
                Some(Ok(true)) => last_renewal = Instant::now(),
                Some(Ok(false)) => {
                    info!("leader lost: lease taken by another holder");
                    return false;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "failed to renew lease");
                    if last_renewal.elapsed() >= self.config.renew_deadline {
                        self.log_deadline_exceeded();
                        return false;
                    }
                }
            }
        }
    }

    fn log_deadline_exceeded(&self) {
        error!(
            renew_deadline = ?self.config.renew_deadline,
            "leader lost: renew deadline exceeded"
        );
    }

    /// One acquire-or-renew attempt cut off after `limit`. `None` once `shutdown` fires.
    async fn attempt(
        &self,
        limit: Duration,
        shutdown: &CancellationToken,
    ) -> Option<LeaderResult<bool>> {
        tokio::select! {
            _ = shutdown.cancelled() => None,
            result = tokio::time::timeout(limit, self.try_acquire_or_renew()) => Some(
                result.unwrap_or_else(|_| {
                    Err(LeaderError::timeout(format!(
                        "lease {} not written within {:?}",
                        self.store.describe(),
                        limit
                    )))
                }),
            ),
        }
    }

    /// One acquire-or-renew attempt. `Ok(false)` means a valid lease is held elsewhere.
    async fn try_acquire_or_renew(&self) -> LeaderResult<bool> {
        let now = Utc::now();
        let identity = self.config.identity.as_str();

        let Some(current) = self.store.get().await? else {
            let record = LeaseRecord {
                holder_identity: Some(identity.to_string()),
                lease_duration: self.config.lease_duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                leader_transitions: 0,
                version: None,
            };
            let created = self.store.create(&record).await?;
            self.remember(created).await;
            self.observe(identity).await;
            return Ok(true);
        };

        let unchanged_for = self.unchanged_for(&current).await;
        if let Some(holder) = current.holder() {
            self.observe(holder).await;
        }

        let held_by_us = current.holder() == Some(identity);
        if !held_by_us && current.holder().is_some() && unchanged_for < current.lease_duration {
            return Ok(false);
        }

        let mut next = current.clone();
        next.lease_duration = self.config.lease_duration;
        next.renew_time = Some(now);
        if !held_by_us {
            next.holder_identity = Some(identity.to_string());
            next.acquire_time = Some(now);
            next.leader_transitions += 1;
        }

        let stored = self.store.update(&next).await?;
        self.remember(stored).await;
        self.observe(identity).await;
        Ok(true)
    }

    /// How long `current` has gone without changing, on the local clock.
    async fn unchanged_for(&self, current: &LeaseRecord) -> Duration {
        let mut observed = self.observed_record.lock().await;
        match observed.as_ref() {
            Some(seen) if seen.record == *current => seen.at.elapsed(),
            _ => {
                *observed = Some(Observation {
                    record: current.clone(),
                    at: Instant::now(),
                });
                Duration::ZERO
            }
        }
    }

    async fn remember(&self, record: LeaseRecord) {
        *self.observed_record.lock().await = Some(Observation {
            record,
            at: Instant::now(),
        });
    }

    /// Clear the holder so a successor need not wait for expiry. Best-effort.
    async fn release(&self) {
        let identity = self.config.identity.as_str();
        let current = match self.store.get().await {
            Ok(Some(current)) if current.holder() == Some(identity) => current,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "failed to read lease for release");
                return;
            }
        };

        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: Duration::from_secs(1),
            acquire_time: Some(now),
            renew_time: Some(now),
            ..current
        };

        match self.store.update(&released).await {
            Ok(stored) => {
                self.remember(stored).await;
                info!(lease = %self.store.describe(), "released lease")
            }
            Err(e) => warn!(error = %e, "failed to release lease"),
        }
    }

    async fn observe(&self, identity: &str) {
        let mut observed = self.observed_leader.write().await;
        if observed.as_deref() == Some(identity) {
            return;
        }
        *observed = Some(identity.to_string());
        drop(observed);

        info!(
            identity,
            is_self = identity == self.config.identity,
            "new leader elected"
        );
        self.callbacks.on_observed_leader(identity);
    }
}
