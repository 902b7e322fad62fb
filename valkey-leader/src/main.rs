use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use valkey_leader_shared::{
    ElectionCallbacks, KubeLeaseStore, KubePodStore, LeaderElector, LeadershipFlag,
    MetadataStore, PrimaryDiscovery, ReconcileMetrics, RoleLabeler, RoleReconciler,
    ValkeyInstance,
};

mod config;
mod health;

use config::{AgentArgs, AgentSettings, LogFormat};

#[tokio::main]
async fn main() {
    let args = AgentArgs::parse();
    init_tracing(&args.log_level, args.log_format);

    let span = info_span!(
        "valkey_leader",
        cluster_name = %args.cluster_name,
        namespace = %args.namespace,
        pod_ip = %args.pod_ip,
        pod_name = %args.pod_name,
        service_name = %args.service_name,
        leader_lease_name = args.leader_lease_name.as_deref().unwrap_or(&args.cluster_name),
    );

    let result = async {
        let settings = args.into_settings().context("invalid configuration")?;
        run(settings).await
    }
    .instrument(span)
    .await;

    if let Err(e) = result {
        error!(error = %format!("{:#}", e), "valkey-leader failed");
        std::process::exit(1);
    }
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init(),
    }
}

async fn run(settings: AgentSettings) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %settings.service_name,
        lease = %settings.election.lease_name,
        "starting valkey-leader"
    );

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    info!("kubernetes client initialized");

    let pods: Arc<dyn MetadataStore> = Arc::new(KubePodStore::new(client.clone(), &settings.namespace));
    let labeler = RoleLabeler::new(
        pods.clone(),
        settings.identity.name.clone(),
        settings.reconciler.cluster_name.clone(),
    );
    labeler
        .join_cluster()
        .await
        .context("failed to set cluster label")?;

    let instance = Arc::new(
        ValkeyInstance::new(
            &settings.valkey_addr,
            settings.valkey_port,
            settings.valkey_command_timeout,
        )
        .context("failed to configure valkey client")?,
    );

    let shutdown = CancellationToken::new();
    let flag = Arc::new(LeadershipFlag::new());
    let reconciler = Arc::new(RoleReconciler::new(
        settings.identity.clone(),
        settings.reconciler.clone(),
        instance,
        labeler,
        PrimaryDiscovery::new(pods),
        flag.clone(),
        Arc::new(ReconcileMetrics::new(
            &settings.reconciler.cluster_name,
            &settings.identity.name,
        )),
        shutdown.clone(),
    ));

    let leases = Arc::new(KubeLeaseStore::new(
        client,
        &settings.election.namespace,
        &settings.election.lease_name,
    ));
    let callbacks: Arc<dyn ElectionCallbacks> = reconciler.clone();
    let elector = LeaderElector::new(settings.election.clone(), leases, flag.clone(), callbacks);

    tokio::spawn(
        {
            let flag = flag.clone();
            let shutdown = shutdown.clone();
            async move {
                wait_for_signal().await;
                info!("received termination, signaling shutdown");
                flag.set(false);
                shutdown.cancel();
            }
        }
        .in_current_span(),
    );

    let health_task = tokio::spawn(
        health::serve(
            settings.health_addr,
            reconciler.clone(),
            metrics,
            shutdown.clone(),
        )
        .in_current_span(),
    );

    let follow_task = tokio::spawn(
        {
            let reconciler = reconciler.clone();
            async move { reconciler.run().await }
        }
        .in_current_span(),
    );

    elector.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = follow_task.await {
        warn!(error = %e, "replica reconciliation ended abnormally");
    }
    reconciler.shutdown().await;

    match health_task.await {
        Ok(Err(e)) => warn!(error = %format!("{:#}", e), "health server stopped with error"),
        Err(e) => warn!(error = %e, "health server ended abnormally"),
        Ok(Ok(())) => {}
    }

    info!("valkey-leader shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
