// Cluster sweep: probe each configured cluster in turn and route the verdict
// to alerts, incidents, metrics and analytics.
use pulsemon_broker::{Credential, Endpoint, TrustMaterial};
use pulsemon_probe::{
    AnomalyDetector, DEFAULT_PAYLOAD_PREFIX, LatencyProbe, MeasurementResult, PayloadBatch,
    ProbeFailure, ProbeTarget,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{ClusterTarget, MonitorConfig};
use crate::sinks::{AnalyticsEvent, LatencyReport, Sinks};

pub const INCIDENT_TITLE: &str = "persisted latency test failure";

/// Outcome of one cluster probe, in decision order.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The run failed; latency is the failure sentinel.
    Failed { error: String },
    OutOfOrder,
    OverBudget,
    /// Within budget. `ordinary` is the anomaly detector's judgement.
    Healthy { ordinary: bool, sigma: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterReport {
    pub cluster: String,
    pub latency: Duration,
    pub budget: Duration,
    pub verdict: Verdict,
}

pub struct ClusterSweep {
    probe: LatencyProbe,
    detector: Arc<AnomalyDetector>,
    sinks: Arc<dyn Sinks>,
    token: Option<String>,
    trust_store: PathBuf,
}

impl ClusterSweep {
    pub fn new(
        probe: LatencyProbe,
        detector: Arc<AnomalyDetector>,
        sinks: Arc<dyn Sinks>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            probe,
            detector,
            sinks,
            token: config.token.clone(),
            trust_store: config.trust_store.clone(),
        }
    }

    pub fn probe(&self) -> &LatencyProbe {
        &self.probe
    }

    /// Probe every cluster sequentially.
    pub async fn run(&self, clusters: &[ClusterTarget]) -> Vec<ClusterReport> {
        let mut reports = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            reports.push(self.probe_cluster(cluster).await);
        }
        reports
    }

    pub async fn probe_cluster(&self, cluster: &ClusterTarget) -> ClusterReport {
        let name = cluster.name();
        let budget = cluster.latency_budget();
        let batch = PayloadBatch::generate(
            DEFAULT_PAYLOAD_PREFIX,
            &cluster.payload_sizes,
            cluster.message_count,
        );
        info!(
            cluster = %name,
            topic = %cluster.topic,
            messages = batch.len(),
            budget_ms = budget.as_millis() as u64,
            "probing cluster"
        );
        let outcome = self.probe.run(&self.target(cluster), &batch).await;
        let report = self.decide(&name, cluster, budget, outcome).await;
        info!(
            cluster = %name,
            latency_ms = report.latency.as_millis() as u64,
            verdict = ?report.verdict,
            "cluster probed"
        );
        report
    }

    fn target(&self, cluster: &ClusterTarget) -> ProbeTarget {
        let token = cluster.token.as_ref().or(self.token.as_ref());
        let trust_store = cluster.trust_store.as_ref().unwrap_or(&self.trust_store);
        ProbeTarget {
            endpoint: Endpoint::new(cluster.url.trim()),
            credential: token.map(Credential::token).unwrap_or_default(),
            trust: TrustMaterial::ca_bundle(trust_store.clone()),
            topic: cluster.topic.clone(),
        }
    }

    async fn decide(
        &self,
        name: &str,
        cluster: &ClusterTarget,
        budget: Duration,
        outcome: Result<MeasurementResult, ProbeFailure>,
    ) -> ClusterReport {
        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err(failure) => (failure.result, Some(failure.to_string())),
        };
        let latency = result.latency;
        // Only real measurements feed the series; the failure sentinel would skew it.
        let anomaly = error
            .is_none()
            .then(|| self.detector.push(name, latency.as_millis() as f64));

        let verdict = if let Some(error) = &error {
            let message = format!("cluster {name} latency test broker error: {error}");
            self.sinks.alert(&message).await;
            self.sinks
                .report_incident(name, INCIDENT_TITLE, &message, &cluster.alert_policy)
                .await;
            Verdict::Failed {
                error: error.clone(),
            }
        } else if !result.in_order {
            let message = format!("cluster {name} message received out of order");
            self.sinks.alert(&message).await;
            Verdict::OutOfOrder
        } else if latency > budget {
            let message =
                format!("cluster {name} message latency {latency:?} over the budget {budget:?}");
            self.sinks.alert(&message).await;
            self.sinks
                .report_incident(name, INCIDENT_TITLE, &message, &cluster.alert_policy)
                .await;
            Verdict::OverBudget
        } else {
            self.sinks.clear_incident(name).await;
            let (sigma, ordinary) = anomaly.unwrap_or((0.0, true));
            if !ordinary && cluster.alert_policy.alert_on_anomaly {
                let message = format!(
                    "cluster {name} message latency {latency:?} is outside two standard deviations ({sigma:.1}ms) of its history"
                );
                self.sinks.alert(&message).await;
            }
            Verdict::Healthy { ordinary, sigma }
        };

        self.sinks.emit_latency(name, latency).await;
        self.sinks
            .forward_analytics(AnalyticsEvent::LatencyReport(LatencyReport::new(
                name,
                &cluster.topic,
                latency.as_millis() as u64,
                result.in_order,
                latency <= budget,
                error,
            )))
            .await;

        ClusterReport {
            cluster: name.to_string(),
            latency,
            budget,
            verdict,
        }
    }
}
