//! Tracing and metrics setup for the monitor service.
//! Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`) and a
//! Prometheus metrics recorder, and serves `/metrics`, `/live` and `/ready` over `axum`.
//! The recorder is process-global, so its handle is cached and repeated initialization reuses it.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and metrics for the service.
///
/// Returns a `PrometheusHandle` for serving metrics.
pub fn init_observability() -> Result<PrometheusHandle> {
    // Use environment variable for log filtering; default to "info" if unset or invalid.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));

    install_metrics_recorder()
}

/// Serves Prometheus metrics and health endpoints on the given socket address.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, metrics_router(handle).into_make_service()).await
}

fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// A subscriber installed earlier (tests, embedding binaries) is left in place.
fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    let _ = subscriber.try_init();
}
