use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use valkey_leader_shared::RoleReconciler;

/// Serve liveness, readiness, role status and metrics until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    reconciler: Arc<RoleReconciler>,
    metrics: PrometheusHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let reconciler = reconciler.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let reconciler = reconciler.clone();
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(handle_request(req, &reconciler, &metrics).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind health server on {}", addr))?
        .serve(make_svc);

    info!(%addr, "health server listening");

    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("health server failed")?;

    info!("health server stopped");
    Ok(())
}

async fn handle_request(
    req: Request<Body>,
    reconciler: &RoleReconciler,
    metrics: &PrometheusHandle,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "health request");

    if method != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed");
    }

    match path.as_str() {
        "/healthz" => respond(StatusCode::OK, "application/json", r#"{"status":"healthy"}"#),
        "/readyz" => {
            if reconciler.is_ready() {
                respond(StatusCode::OK, "application/json", r#"{"status":"ready"}"#)
            } else {
                respond(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "application/json",
                    r#"{"status":"not ready"}"#,
                )
            }
        }
        "/role" => {
            let mut status = reconciler.status();
            match reconciler.labeled_role().await {
                Ok(role) => status.labeled_role = Some(role),
                Err(e) => warn!(error = %e, "failed to read role label"),
            }
            match serde_json::to_string(&status) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("failed to encode status: {}", e),
                ),
            }
        }
        "/metrics" => respond(StatusCode::OK, "text/plain; version=0.0.4", metrics.render()),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
