// Analytics event forwarder.
// Events are wrapped in a one-event batch envelope and POSTed as JSON to the
// ingestion endpoint. Every event carries the deployment label and a timestamp.
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::AnalyticsConfig;

const PLATFORM: &str = "k8s";
const REPORTED_BY: &str = "pulsemon monitor";
const LATENCY_CATEGORY: &str = "pubsub latency";
const NO_SESSION: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStart {
    pub cluster: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyReport {
    pub cluster: String,
    pub category: String,
    // Topic the probe ran against.
    pub name: String,
    pub latency_ms: u64,
    pub in_order_delivery: bool,
    pub within_latency_budget: bool,
    // Empty when the run succeeded.
    pub error: String,
}

impl LatencyReport {
    pub fn new(
        cluster: &str,
        topic: &str,
        latency_ms: u64,
        in_order_delivery: bool,
        within_latency_budget: bool,
        error: Option<String>,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            category: LATENCY_CATEGORY.to_string(),
            name: topic.to_string(),
            latency_ms,
            in_order_delivery,
            within_latency_budget,
            error: error.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentReport {
    pub cluster: String,
    pub alias: String,
    pub message: String,
    pub description: String,
    pub reported_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentCleared {
    pub cluster: String,
    pub duration_seconds: u64,
    pub reported_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsEvent {
    AppStart(AppStart),
    LatencyReport(LatencyReport),
    ReportIncident(IncidentReport),
    ClearIncident(IncidentCleared),
}

impl AnalyticsEvent {
    pub fn app_start(instance: &str) -> Self {
        Self::AppStart(AppStart {
            cluster: instance.to_string(),
            name: REPORTED_BY.to_string(),
        })
    }

    pub fn report_incident(cluster: &str, title: &str, message: &str) -> Self {
        Self::ReportIncident(IncidentReport {
            cluster: cluster.to_string(),
            alias: title.to_string(),
            message: message.to_string(),
            description: message.to_string(),
            reported_by: REPORTED_BY.to_string(),
        })
    }

    pub fn clear_incident(cluster: &str, duration_seconds: u64) -> Self {
        Self::ClearIncident(IncidentCleared {
            cluster: cluster.to_string(),
            duration_seconds,
            reported_by: REPORTED_BY.to_string(),
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AppStart(_) => "App Start",
            Self::LatencyReport(_) => "Latency Report",
            Self::ReportIncident(_) => "Report Incident",
            Self::ClearIncident(_) => "Clear Incident",
        }
    }

    /// Subject of the event, used as both user and device id.
    pub fn cluster(&self) -> &str {
        match self {
            Self::AppStart(props) => &props.cluster,
            Self::LatencyReport(props) => &props.cluster,
            Self::ReportIncident(props) => &props.cluster,
            Self::ClearIncident(props) => &props.cluster,
        }
    }

    fn properties(&self) -> Result<Map<String, Value>> {
        let value = match self {
            Self::AppStart(props) => serde_json::to_value(props),
            Self::LatencyReport(props) => serde_json::to_value(props),
            Self::ReportIncident(props) => serde_json::to_value(props),
            Self::ClearIncident(props) => serde_json::to_value(props),
        }
        .context("serialize event properties")?;
        match value {
            Value::Object(map) => Ok(map),
            other => bail!("event properties must be an object, got {other}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    api_key: &'a str,
    events: Vec<EnvelopeEvent>,
}

#[derive(Debug, Serialize)]
struct EnvelopeEvent {
    user_id: String,
    device_id: String,
    event_type: &'static str,
    // Dedupe key on the ingestion side.
    insert_id: String,
    session_id: i64,
    time: i64,
    event_properties: Map<String, Value>,
    platform: &'static str,
}

#[derive(Debug, Clone)]
pub struct AnalyticsForwarder {
    client: reqwest::Client,
    api_key: String,
    ingestion_url: String,
    deploy_env: String,
}

impl AnalyticsForwarder {
    pub fn new(client: reqwest::Client, config: &AnalyticsConfig, deploy_env: &str) -> Result<Self> {
        if config.api_key.is_empty() || config.ingestion_url.is_empty() {
            bail!("analytics requires both an api key and an ingestion url");
        }
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            ingestion_url: config.ingestion_url.clone(),
            deploy_env: deploy_env.to_string(),
        })
    }

    /// Build the JSON body for `event` as of `now`.
    pub fn envelope(&self, event: &AnalyticsEvent, now: DateTime<Utc>) -> Result<Value> {
        let epoch = now.timestamp_nanos_opt().unwrap_or_default();
        let mut event_properties = event.properties()?;
        event_properties.insert("deployEnv".to_string(), Value::from(self.deploy_env.clone()));
        event_properties.insert("timestamp".to_string(), Value::from(now.to_rfc3339()));
        let cluster = event.cluster().to_string();
        let envelope = Envelope {
            api_key: &self.api_key,
            events: vec![EnvelopeEvent {
                user_id: cluster.clone(),
                insert_id: format!("{cluster}{epoch}"),
                device_id: cluster,
                event_type: event.event_type(),
                session_id: NO_SESSION,
                time: epoch,
                event_properties,
                platform: PLATFORM,
            }],
        };
        serde_json::to_value(&envelope).context("serialize analytics envelope")
    }

    pub async fn send(&self, event: &AnalyticsEvent) -> Result<()> {
        let body = self.envelope(event, Utc::now())?;
        let response = self
            .client
            .post(&self.ingestion_url)
            .header(reqwest::header::ACCEPT, "*/*")
            .json(&body)
            .send()
            .await
            .context("analytics request")?;
        let status = response.status();
        tracing::debug!(event_type = event.event_type(), status = status.as_u16(), "analytics event sent");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("analytics endpoint returned {status}: {text}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::State;
    use axum::http::StatusCode;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn forwarder(url: String) -> AnalyticsForwarder {
        AnalyticsForwarder::new(
            reqwest::Client::new(),
            &AnalyticsConfig {
                api_key: "key".to_string(),
                ingestion_url: url,
            },
            "staging",
        )
        .expect("forwarder")
    }

    #[derive(Clone, Default)]
    struct Captured {
        bodies: Arc<Mutex<Vec<Value>>>,
    }

    async fn spawn_ingest(status: StatusCode) -> (String, Captured) {
        let captured = Captured::default();
        let app = axum::Router::new()
            .route(
                "/ingest",
                axum::routing::post(
                    move |State(captured): State<Captured>, Json(body): Json<Value>| async move {
                        captured.bodies.lock().push(body);
                        status
                    },
                ),
            )
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.ok();
        });
        (format!("http://{addr}/ingest"), captured)
    }

    #[test]
    fn empty_config_is_rejected() {
        let err = AnalyticsForwarder::new(
            reqwest::Client::new(),
            &AnalyticsConfig {
                api_key: String::new(),
                ingestion_url: "http://localhost/ingest".to_string(),
            },
            "testing",
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("api key"));
    }

    #[test]
    fn envelope_carries_event_and_properties() {
        let forwarder = forwarder("http://localhost/ingest".to_string());
        let now = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let event = AnalyticsEvent::LatencyReport(LatencyReport::new(
            "useast1.example.io",
            "persistent://tenant/ns/latency",
            1800,
            true,
            true,
            None,
        ));
        let body = forwarder.envelope(&event, now).expect("envelope");
        let nanos = now.timestamp_nanos_opt().expect("nanos");

        assert_eq!(body["api_key"], "key");
        let sent = &body["events"][0];
        assert_eq!(sent["event_type"], "Latency Report");
        assert_eq!(sent["user_id"], "useast1.example.io");
        assert_eq!(sent["device_id"], "useast1.example.io");
        assert_eq!(sent["insert_id"], format!("useast1.example.io{nanos}"));
        assert_eq!(sent["session_id"], -1);
        assert_eq!(sent["time"], nanos);
        assert_eq!(sent["platform"], "k8s");

        let props = &sent["event_properties"];
        assert_eq!(props["latencyMs"], 1800);
        assert_eq!(props["inOrderDelivery"], true);
        assert_eq!(props["withinLatencyBudget"], true);
        assert_eq!(props["error"], "");
        assert_eq!(props["deployEnv"], "staging");
        assert_eq!(props["timestamp"], now.to_rfc3339());
    }

    #[test]
    fn event_types_match_ingestion_names() {
        assert_eq!(AnalyticsEvent::app_start("m").event_type(), "App Start");
        assert_eq!(
            AnalyticsEvent::report_incident("c", "t", "m").event_type(),
            "Report Incident"
        );
        assert_eq!(
            AnalyticsEvent::clear_incident("c", 5).event_type(),
            "Clear Incident"
        );
    }

    #[tokio::test]
    async fn send_posts_envelope() {
        let (url, captured) = spawn_ingest(StatusCode::OK).await;
        let forwarder = forwarder(url);
        forwarder
            .send(&AnalyticsEvent::report_incident(
                "useast1.example.io",
                "persisted latency test failure",
                "cluster useast1.example.io latency over budget",
            ))
            .await
            .expect("send");
        let bodies = captured.bodies.lock();
        assert_eq!(bodies.len(), 1);
        let props = &bodies[0]["events"][0]["event_properties"];
        assert_eq!(props["alias"], "persisted latency test failure");
        assert_eq!(props["reportedBy"], "pulsemon monitor");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (url, captured) = spawn_ingest(StatusCode::BAD_REQUEST).await;
        let err = forwarder(url)
            .send(&AnalyticsEvent::app_start("monitor-0"))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("400"));
        assert_eq!(captured.bodies.lock().len(), 1);
    }
}
