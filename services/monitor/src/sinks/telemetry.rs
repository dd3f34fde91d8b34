// Latency metrics per cluster.
use std::time::Duration;

pub const LATENCY_GAUGE: &str = "pulsemon_pubsub_latency_ms";
pub const LATENCY_HISTOGRAM: &str = "pulsemon_pubsub_latency_seconds";
pub const ALERTS_TOTAL: &str = "pulsemon_alerts_total";
pub const INCIDENTS_OPENED_TOTAL: &str = "pulsemon_incidents_opened_total";

/// Last measured latency as a gauge plus a histogram of every measurement.
pub fn record_latency(cluster: &str, latency: Duration) {
    let cluster = cluster.to_string();
    metrics::gauge!(LATENCY_GAUGE, "cluster" => cluster.clone()).set(latency.as_millis() as f64);
    metrics::histogram!(LATENCY_HISTOGRAM, "cluster" => cluster).record(latency.as_secs_f64());
}

pub fn record_alert() {
    metrics::counter!(ALERTS_TOTAL).increment(1);
}

pub fn record_incident_opened(cluster: &str) {
    metrics::counter!(INCIDENTS_OPENED_TOTAL, "cluster" => cluster.to_string()).increment(1);
}
