use clap::{ArgAction, Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use valkey_leader_shared::{
    ElectionConfig, LeaderError, LeaderResult, NodeIdentity, ReconcilerConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "valkey-leader")]
#[command(about = "Keeps Valkey pods in a primary/replica topology via lease election")]
pub struct AgentArgs {
    /// Cluster this pod belongs to
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// Namespace of the pods and the lease
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    /// This pod's IP; also the lease holder identity
    #[arg(long, env = "POD_IP")]
    pub pod_ip: String,

    /// This pod's name
    #[arg(long, env = "POD_NAME")]
    pub pod_name: String,

    /// Service fronting the cluster
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: String,

    /// Lease name (defaults to the cluster name)
    #[arg(long, env = "LEADER_LEASE_NAME")]
    pub leader_lease_name: Option<String>,

    /// Address of the local Valkey instance
    #[arg(long, env = "VALKEY_ADDR", default_value = "127.0.0.1:6379")]
    pub valkey_addr: String,

    /// Port replicas use to reach the primary
    #[arg(long, env = "VALKEY_PORT", default_value_t = 6379)]
    pub valkey_port: u16,

    /// Upper bound for a single instance command
    #[arg(long, env = "VALKEY_COMMAND_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub valkey_command_timeout: Duration,

    /// Reconciliation cadence
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    pub reconcile_interval: Duration,

    #[arg(long, env = "LEASE_DURATION", default_value = "60s", value_parser = humantime::parse_duration)]
    pub lease_duration: Duration,

    #[arg(long, env = "RENEW_DEADLINE", default_value = "15s", value_parser = humantime::parse_duration)]
    pub renew_deadline: Duration,

    #[arg(long, env = "RETRY_PERIOD", default_value = "5s", value_parser = humantime::parse_duration)]
    pub retry_period: Duration,

    /// Release the lease on shutdown instead of letting it expire
    #[arg(long, env = "RELEASE_ON_CANCEL", default_value_t = true, action = ArgAction::Set)]
    pub release_on_cancel: bool,

    /// Upper bound for withdrawing the role label on shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,

    /// Remove this pod's role label on shutdown
    #[arg(long, env = "DEREGISTER_ON_SHUTDOWN", default_value_t = true, action = ArgAction::Set)]
    pub deregister_on_shutdown: bool,

    /// Health, role and metrics bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: SocketAddr,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Validated agent settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub identity: NodeIdentity,
    pub namespace: String,
    pub service_name: String,
    pub election: ElectionConfig,
    pub reconciler: ReconcilerConfig,
    pub valkey_addr: String,
    pub valkey_port: u16,
    pub valkey_command_timeout: Duration,
    pub health_addr: SocketAddr,
}

fn required(name: &str, value: String) -> LeaderResult<String> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(LeaderError::configuration(format!("{} must not be empty", name)));
    }
    Ok(value)
}

impl AgentArgs {
    pub fn into_settings(self) -> LeaderResult<AgentSettings> {
        let cluster_name = required("CLUSTER_NAME", self.cluster_name)?;
        let namespace = required("NAMESPACE", self.namespace)?;
        let pod_ip = required("POD_IP", self.pod_ip)?;
        let pod_name = required("POD_NAME", self.pod_name)?;
        let service_name = required("SERVICE_NAME", self.service_name)?;

        pod_ip
            .parse::<IpAddr>()
            .map_err(|e| LeaderError::configuration(format!("POD_IP {:?} is not an IP address: {}", pod_ip, e)))?;

        let lease_name = self
            .leader_lease_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| cluster_name.clone());

        if self.reconcile_interval.is_zero() {
            return Err(LeaderError::configuration("RECONCILE_INTERVAL must be positive"));
        }
        if self.valkey_command_timeout.is_zero() {
            return Err(LeaderError::configuration("VALKEY_COMMAND_TIMEOUT must be positive"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(LeaderError::configuration("SHUTDOWN_TIMEOUT must be positive"));
        }

        let election = ElectionConfig {
            lease_name,
            namespace: namespace.clone(),
            identity: pod_ip.clone(),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            release_on_cancel: self.release_on_cancel,
        };
        election.validate()?;

        Ok(AgentSettings {
            identity: NodeIdentity::new(pod_ip, pod_name),
            namespace,
            service_name,
            election,
            reconciler: ReconcilerConfig {
                cluster_name,
                interval: self.reconcile_interval,
                deregister_on_shutdown: self.deregister_on_shutdown,
                shutdown_timeout: self.shutdown_timeout,
            },
            valkey_addr: self.valkey_addr,
            valkey_port: self.valkey_port,
            valkey_command_timeout: self.valkey_command_timeout,
            health_addr: self.health_addr,
        })
    }
}
