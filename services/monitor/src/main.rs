// Monitor service main entry point.
use anyhow::{Context, Result, bail};
use clap::Parser;
use pulsemon_broker::{Endpoint, InProcessBroker, InProcessConnector, LOOPBACK_SCHEME, is_loopback};
use pulsemon_monitor::config::MonitorConfig;
use pulsemon_monitor::observability;
use pulsemon_monitor::sinks::{AnalyticsEvent, LiveSinks, Sinks};
use pulsemon_monitor::sweep::ClusterSweep;
use pulsemon_probe::{AnomalyDetector, ConnectionCache, LatencyProbe, ProbeConfig};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

#[derive(Parser, Debug)]
#[command(name = "pulsemon-monitor")]
#[command(about = "Publish/subscribe latency monitor")]
struct Args {
    /// YAML config file; overrides PULSEMON_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single sweep and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Probe the in-process loopback broker whatever the cluster URLs say
    #[arg(long, default_value_t = false)]
    self_test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    run_with_shutdown(args, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(args: Args, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability()?;

    let config = match args.config.as_deref() {
        Some(path) => MonitorConfig::load(Some(path)),
        None => MonitorConfig::from_env_or_yaml(),
    }
    .context("load monitor config")?;
    check_backend(&config, args.self_test)?;
    tracing::info!(
        clusters = config.clusters.len(),
        interval_ms = config.sweep_interval_ms,
        "monitor config loaded"
    );

    // Expose Prometheus metrics on the configured bind address.
    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let broker = Arc::new(InProcessBroker::new());
    let connector = Arc::new(InProcessConnector::new(broker));
    let cache = Arc::new(ConnectionCache::new(connector));
    let probe = LatencyProbe::new(cache, ProbeConfig::default());

    let sinks = Arc::new(LiveSinks::from_config(&config)?);
    sinks
        .forward_analytics(AnalyticsEvent::app_start(&config.instance_id))
        .await;
    let sweep = ClusterSweep::new(probe, Arc::new(AnomalyDetector::new()), sinks, &config);
    tracing::info!(instance = %config.instance_id, "monitor started");

    if args.once {
        sweep.run(&config.clusters).await;
        tracing::info!("single sweep finished");
        return Ok(());
    }

    let mut interval = tokio::time::interval(config.sweep_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                sweep.run(&config.clusters).await;
            }
        }
    }
    tracing::info!("monitor stopped");
    Ok(())
}

/// The loopback broker is the only backend; any other cluster URL is refused
/// unless self-test mode routes it there explicitly.
fn check_backend(config: &MonitorConfig, self_test: bool) -> Result<()> {
    let foreign: Vec<&str> = config
        .clusters
        .iter()
        .map(|cluster| cluster.url.as_str())
        .filter(|url| !is_loopback(&Endpoint::new(*url)))
        .collect();
    if foreign.is_empty() {
        return Ok(());
    }
    if self_test {
        tracing::warn!(
            clusters = ?foreign,
            "self-test mode: probing the in-process broker instead of these clusters"
        );
        return Ok(());
    }
    bail!(
        "no broker client for {}; use {LOOPBACK_SCHEME}:// urls or pass --self-test",
        foreign.join(", ")
    )
}
