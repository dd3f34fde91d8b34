// End-to-end sweep decisions against the in-process broker, with recording sinks.
use async_trait::async_trait;
use parking_lot::Mutex;
use pulsemon_broker::{FaultPlan, InProcessBroker, InProcessConnector};
use pulsemon_monitor::config::{AlertPolicy, ClusterTarget, MonitorConfig};
use pulsemon_monitor::sinks::{AnalyticsEvent, Sinks};
use pulsemon_monitor::sweep::{ClusterSweep, INCIDENT_TITLE, Verdict};
use pulsemon_probe::{AnomalyDetector, ConnectionCache, FAILED_LATENCY, LatencyProbe, ProbeConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Alert(String),
    ReportIncident { cluster: String, title: String, message: String },
    ClearIncident(String),
    Latency(String, Duration),
    Analytics(AnalyticsEvent),
}

#[derive(Default)]
struct RecordingSinks {
    calls: Mutex<Vec<Call>>,
}

impl RecordingSinks {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn alerts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Alert(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matches(call)).count()
    }
}

#[async_trait]
impl Sinks for RecordingSinks {
    async fn alert(&self, message: &str) {
        self.calls.lock().push(Call::Alert(message.to_string()));
    }

    async fn report_incident(&self, cluster: &str, title: &str, message: &str, _policy: &AlertPolicy) {
        self.calls.lock().push(Call::ReportIncident {
            cluster: cluster.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    async fn clear_incident(&self, cluster: &str) {
        self.calls.lock().push(Call::ClearIncident(cluster.to_string()));
    }

    async fn emit_latency(&self, cluster: &str, latency: Duration) {
        self.calls
            .lock()
            .push(Call::Latency(cluster.to_string(), latency));
    }

    async fn forward_analytics(&self, event: AnalyticsEvent) {
        self.calls.lock().push(Call::Analytics(event));
    }
}

struct Harness {
    broker: Arc<InProcessBroker>,
    sinks: Arc<RecordingSinks>,
    sweep: ClusterSweep,
}

fn harness(faults: FaultPlan) -> Harness {
    let broker = Arc::new(InProcessBroker::with_faults(faults));
    let connector = Arc::new(InProcessConnector::new(Arc::clone(&broker)));
    let probe = LatencyProbe::new(
        Arc::new(ConnectionCache::new(connector)),
        ProbeConfig::default(),
    );
    let sinks = Arc::new(RecordingSinks::default());
    let config = MonitorConfig {
        metrics_bind: "127.0.0.1:0".parse().expect("addr"),
        sweep_interval_ms: 1000,
        token: Some("global-token".to_string()),
        trust_store: "/etc/ssl/certs/ca-bundle.crt".into(),
        alert_webhook_url: None,
        incident_webhook_url: None,
        analytics: None,
        deploy_env: "testing".to_string(),
        instance_id: "monitor-0".to_string(),
        clusters: Vec::new(),
    };
    let sweep = ClusterSweep::new(
        probe,
        Arc::new(AnomalyDetector::new()),
        Arc::clone(&sinks) as Arc<dyn Sinks>,
        &config,
    );
    Harness {
        broker,
        sinks,
        sweep,
    }
}

fn cluster() -> ClusterTarget {
    ClusterTarget {
        url: "pulsar+ssl://useast1.example.io:6651".to_string(),
        topic: "persistent://tenant/ns/latency".to_string(),
        token: None,
        trust_store: None,
        payload_sizes: vec![256],
        message_count: 5,
        latency_budget_ms: Some(2400),
        alert_policy: AlertPolicy::default(),
    }
}

fn latency_report(call: &Call) -> Option<&pulsemon_monitor::sinks::LatencyReport> {
    match call {
        Call::Analytics(AnalyticsEvent::LatencyReport(report)) => Some(report),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn within_budget_clears_incident_without_alert() {
    let h = harness(FaultPlan {
        delivery_delay: Duration::from_millis(1800),
        ..FaultPlan::default()
    });
    let report = h.sweep.probe_cluster(&cluster()).await;

    assert_eq!(report.cluster, "useast1.example.io");
    assert_eq!(report.latency, Duration::from_millis(1800));
    assert!(matches!(report.verdict, Verdict::Healthy { ordinary: true, .. }));
    assert!(h.sinks.alerts().is_empty());

    let calls = h.sinks.calls();
    assert_eq!(calls[0], Call::ClearIncident("useast1.example.io".to_string()));
    assert_eq!(
        calls[1],
        Call::Latency("useast1.example.io".to_string(), Duration::from_millis(1800))
    );
    let analytics = latency_report(&calls[2]).expect("latency report");
    assert_eq!(analytics.latency_ms, 1800);
    assert!(analytics.in_order_delivery);
    assert!(analytics.within_latency_budget);
    assert!(analytics.error.is_empty());
}

#[tokio::test(start_paused = true)]
async fn over_budget_alerts_and_reports_incident() {
    let h = harness(FaultPlan {
        delivery_delay: Duration::from_millis(3000),
        ..FaultPlan::default()
    });
    let report = h.sweep.probe_cluster(&cluster()).await;

    assert_eq!(report.verdict, Verdict::OverBudget);
    assert_eq!(report.latency, Duration::from_secs(3));
    let alerts = h.sinks.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("useast1.example.io"));
    assert!(alerts[0].contains("3s"));
    assert!(alerts[0].contains("2.4s"));
    assert!(h.sinks.calls().contains(&Call::ReportIncident {
        cluster: "useast1.example.io".to_string(),
        title: INCIDENT_TITLE.to_string(),
        message: alerts[0].clone(),
    }));
    assert_eq!(h.sinks.count(|call| matches!(call, Call::ClearIncident(_))), 0);
    let calls = h.sinks.calls();
    let analytics = calls.iter().find_map(latency_report).expect("latency report");
    assert!(!analytics.within_latency_budget);
}

#[tokio::test(start_paused = true)]
async fn lost_messages_fail_closed() {
    let h = harness(FaultPlan {
        drop_sequences: HashSet::from([1, 3]),
        ..FaultPlan::default()
    });
    let report = h.sweep.probe_cluster(&cluster()).await;

    assert_eq!(report.latency, FAILED_LATENCY);
    let Verdict::Failed { error } = &report.verdict else {
        panic!("expected failure, got {:?}", report.verdict);
    };
    assert!(error.contains("latency measure not received"));
    assert_eq!(h.sinks.alerts().len(), 1);
    assert_eq!(
        h.sinks.count(|call| matches!(call, Call::ReportIncident { .. })),
        1
    );
    assert!(
        h.sinks
            .calls()
            .contains(&Call::Latency("useast1.example.io".to_string(), FAILED_LATENCY))
    );
    let calls = h.sinks.calls();
    let analytics = calls.iter().find_map(latency_report).expect("latency report");
    assert_eq!(analytics.latency_ms, 100_000);
    assert!(!analytics.error.is_empty());
}

#[tokio::test]
async fn producer_failure_reports_without_subscribing() {
    let h = harness(FaultPlan {
        fail_producer: true,
        ..FaultPlan::default()
    });
    let target = cluster();
    let report = h.sweep.probe_cluster(&target).await;

    assert!(matches!(report.verdict, Verdict::Failed { .. }));
    assert_eq!(report.latency, FAILED_LATENCY);
    assert_eq!(h.broker.subscriber_count(&target.topic), 0);
    assert!(
        !h.sweep
            .probe()
            .cache()
            .contains(&pulsemon_broker::Endpoint::new(target.url.as_str()))
            .await
    );
    assert_eq!(h.sinks.alerts().len(), 1);
    assert_eq!(
        h.sinks.count(|call| matches!(call, Call::ReportIncident { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn out_of_order_alerts_without_incident() {
    let h = harness(FaultPlan {
        reverse_window: 2,
        ..FaultPlan::default()
    });
    // Five messages: two full windows, then a trailing one released on idle.
    let report = h.sweep.probe_cluster(&cluster()).await;

    assert_eq!(report.verdict, Verdict::OutOfOrder);
    // The last message waited out one 5s receive bound: 5000ms / 5.
    assert_eq!(report.latency, Duration::from_millis(1000));
    assert_eq!(
        h.sinks.alerts(),
        vec!["cluster useast1.example.io message received out of order".to_string()]
    );
    assert_eq!(
        h.sinks.count(|call| matches!(call, Call::ReportIncident { .. })),
        0
    );
    assert_eq!(h.sinks.count(|call| matches!(call, Call::ClearIncident(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn anomaly_alerts_only_when_policy_opts_in() {
    let h = harness(FaultPlan {
        delivery_delay: Duration::from_millis(100),
        ..FaultPlan::default()
    });
    let mut target = cluster();
    target.message_count = 1;
    target.alert_policy.alert_on_anomaly = true;

    // Build a history with some spread, then a spike that stays within budget.
    for delay in [100, 110, 90, 100, 105, 95, 100, 110, 90] {
        h.broker.update_faults(|faults| {
            faults.delivery_delay = Duration::from_millis(delay);
        });
        let report = h.sweep.probe_cluster(&target).await;
        assert!(matches!(report.verdict, Verdict::Healthy { ordinary: true, .. }));
    }
    assert!(h.sinks.alerts().is_empty());

    h.broker.update_faults(|faults| {
        faults.delivery_delay = Duration::from_millis(2000);
    });
    let report = h.sweep.probe_cluster(&target).await;
    assert!(matches!(report.verdict, Verdict::Healthy { ordinary: false, .. }));
    let alerts = h.sinks.alerts();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("two standard deviations"));
}

#[tokio::test(start_paused = true)]
async fn anomaly_without_opt_in_stays_quiet() {
    let h = harness(FaultPlan::default());
    let mut target = cluster();
    target.message_count = 1;

    for delay in [100, 110, 90, 100, 105, 95, 100, 110, 90, 2000] {
        h.broker.update_faults(|faults| {
            faults.delivery_delay = Duration::from_millis(delay);
        });
        h.sweep.probe_cluster(&target).await;
    }
    assert!(h.sinks.alerts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sweep_probes_every_cluster_in_order() {
    let h = harness(FaultPlan::default());
    let east = cluster();
    let west = ClusterTarget {
        url: "pulsar+ssl://uswest2.example.io:6651".to_string(),
        ..cluster()
    };
    let reports = h.sweep.run(&[east, west]).await;
    let names: Vec<&str> = reports.iter().map(|r| r.cluster.as_str()).collect();
    assert_eq!(names, vec!["useast1.example.io", "uswest2.example.io"]);
    // Each cluster gets its own cached connection.
    assert_eq!(h.broker.connect_count(), 2);
}
