//! Outputs of a cluster sweep.
//!
//! # Purpose
//! Alerts, incidents, latency metrics and analytics events. Every sink is
//! fire-and-forget from the sweep's point of view: delivery failures are logged
//! and never propagate back into the sweep.
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod alert;
pub mod analytics;
pub mod incident;
pub mod telemetry;

pub use alert::AlertWebhook;
pub use analytics::{AnalyticsEvent, AnalyticsForwarder, LatencyReport};
pub use incident::{FailureOutcome, IncidentTracker, IncidentWebhook};

use crate::config::{AlertPolicy, MonitorConfig};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Sinks: Send + Sync {
    async fn alert(&self, message: &str);

    async fn report_incident(&self, cluster: &str, title: &str, message: &str, policy: &AlertPolicy);

    async fn clear_incident(&self, cluster: &str);

    async fn emit_latency(&self, cluster: &str, latency: Duration);

    async fn forward_analytics(&self, event: AnalyticsEvent);
}

pub struct LiveSinks {
    alerts: AlertWebhook,
    incidents: IncidentTracker,
    incident_hook: IncidentWebhook,
    analytics: Option<AnalyticsForwarder>,
}

impl LiveSinks {
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")?;
        let analytics = match &config.analytics {
            Some(analytics) => Some(AnalyticsForwarder::new(
                client.clone(),
                analytics,
                &config.deploy_env,
            )?),
            None => {
                info!("analytics forwarding disabled (no api key or ingestion url)");
                None
            }
        };
        let alerts = AlertWebhook::new(client.clone(), config.alert_webhook_url.clone());
        if !alerts.is_configured() {
            info!("alert webhook disabled; alerts are logged only");
        }
        Ok(Self {
            alerts,
            incidents: IncidentTracker::new(),
            incident_hook: IncidentWebhook::new(client, config.incident_webhook_url.clone()),
            analytics,
        })
    }

    pub fn incidents(&self) -> &IncidentTracker {
        &self.incidents
    }
}

#[async_trait]
impl Sinks for LiveSinks {
    async fn alert(&self, message: &str) {
        warn!(message, "alert");
        telemetry::record_alert();
        if let Err(err) = self.alerts.send(message).await {
            warn!(error = %err, "alert delivery failed");
        }
    }

    async fn report_incident(&self, cluster: &str, title: &str, message: &str, policy: &AlertPolicy) {
        match self.incidents.record_failure(cluster, policy) {
            FailureOutcome::Pending { failures } => {
                debug!(cluster, failures, ceiling = policy.ceiling, "failure below incident ceiling");
            }
            FailureOutcome::Ongoing { failures } => {
                debug!(cluster, failures, "incident still open");
            }
            FailureOutcome::Opened { failures } => {
                warn!(cluster, failures, title, "incident opened");
                telemetry::record_incident_opened(cluster);
                if let Err(err) = self.incident_hook.open(cluster, title, message).await {
                    warn!(cluster, error = %err, "incident webhook failed");
                }
                self.forward_analytics(AnalyticsEvent::report_incident(cluster, title, message))
                    .await;
            }
        }
    }

    async fn clear_incident(&self, cluster: &str) {
        let Some(open_for) = self.incidents.record_success(cluster) else {
            return;
        };
        info!(cluster, open_secs = open_for.as_secs(), "incident cleared");
        if let Err(err) = self.incident_hook.resolve(cluster).await {
            warn!(cluster, error = %err, "incident webhook failed");
        }
        self.forward_analytics(AnalyticsEvent::clear_incident(cluster, open_for.as_secs()))
            .await;
    }

    async fn emit_latency(&self, cluster: &str, latency: Duration) {
        telemetry::record_latency(cluster, latency);
    }

    async fn forward_analytics(&self, event: AnalyticsEvent) {
        let Some(analytics) = &self.analytics else {
            return;
        };
        if let Err(err) = analytics.send(&event).await {
            warn!(event_type = event.event_type(), error = %err, "analytics event dropped");
        }
    }
}
