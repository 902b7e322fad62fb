//! Control of the local data-store instance.
//!
//! Only two commands are ever needed: stop replicating and accept writes, or
//! replicate from a given host. Both map onto `REPLICAOF` and are idempotent on
//! the server side, so callers may repeat them every reconciliation tick.

use crate::exception::{LeaderError, LeaderResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Local instance control
#[async_trait]
pub trait InstanceControl: Send + Sync {
    /// Stop replicating and accept writes directly. Safe to repeat.
    async fn promote_to_primary(&self) -> LeaderResult<()>;

    /// Replicate from the instance at `address`. Safe to repeat with the same address.
    async fn replicate_from(&self, address: &str) -> LeaderResult<()>;
}

/// Valkey instance reached over the Redis protocol.
///
/// Every command opens its own connection and drops it afterwards; at one call per
/// tick there is nothing to gain from pooling.
pub struct ValkeyInstance {
    client: redis::Client,
    replication_port: u16,
    command_timeout: Duration,
}

impl ValkeyInstance {
    pub fn new(local_addr: &str, replication_port: u16, command_timeout: Duration) -> LeaderResult<Self> {
        let url = format!("redis://{}/", local_addr);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| LeaderError::configuration(format!("invalid Valkey address {}: {}", local_addr, e)))?;

        Ok(Self {
            client,
            replication_port,
            command_timeout,
        })
    }

    async fn replicaof(&self, args: &[&str]) -> LeaderResult<()> {
        let command = format!("REPLICAOF {}", args.join(" "));
        debug!(%command, "issuing instance command");

        let exchange = async {
            let mut conn = self
                .client
                .get_async_connection()
                .await
                .map_err(|e| LeaderError::instance(&command, e.to_string()))?;

            let mut cmd = redis::cmd("REPLICAOF");
            for arg in args {
                cmd.arg(*arg);
            }
            cmd.query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| LeaderError::instance(&command, e.to_string()))
        };

        match tokio::time::timeout(self.command_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(LeaderError::timeout(command)),
        }
    }
}

#[async_trait]
impl InstanceControl for ValkeyInstance {
    async fn promote_to_primary(&self) -> LeaderResult<()> {
        self.replicaof(&["NO", "ONE"]).await
    }

    async fn replicate_from(&self, address: &str) -> LeaderResult<()> {
        let port = self.replication_port.to_string();
        self.replicaof(&[address, &port]).await
    }
}

/// A command observed by [`RecordingInstance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceCommand {
    Promote,
    ReplicateFrom(String),
}

/// Replication state of a [`RecordingInstance`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InstanceState {
    #[default]
    Unconfigured,
    Primary,
    ReplicaOf(String),
}

/// In-process instance that records commands, for tests and simulations
#[derive(Default)]
pub struct RecordingInstance {
    commands: RwLock<Vec<InstanceCommand>>,
    state: RwLock<InstanceState>,
    failing: AtomicBool,
}

impl RecordingInstance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub async fn commands(&self) -> Vec<InstanceCommand> {
        self.commands.read().await.clone()
    }

    pub async fn state(&self) -> InstanceState {
        self.state.read().await.clone()
    }

    async fn apply(&self, command: InstanceCommand) -> LeaderResult<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(LeaderError::instance(format!("{:?}", command), "instance unreachable"));
        }

        let next = match &command {
            InstanceCommand::Promote => InstanceState::Primary,
            InstanceCommand::ReplicateFrom(address) => InstanceState::ReplicaOf(address.clone()),
        };
        self.commands.write().await.push(command);
        *self.state.write().await = next;
        Ok(())
    }
}

#[async_trait]
impl InstanceControl for RecordingInstance {
    async fn promote_to_primary(&self) -> LeaderResult<()> {
        self.apply(InstanceCommand::Promote).await
    }

    async fn replicate_from(&self, address: &str) -> LeaderResult<()> {
        self.apply(InstanceCommand::ReplicateFrom(address.to_string())).await
    }
}
