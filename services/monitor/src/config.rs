use anyhow::{Context, Result, bail};
use pulsemon_probe::DEFAULT_LATENCY_BUDGET;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Monitor service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Delay between two sweeps over all clusters.
    pub sweep_interval_ms: u64,
    // Token used by clusters that do not carry their own.
    pub token: Option<String>,
    // CA bundle used by clusters that do not carry their own.
    pub trust_store: PathBuf,
    // Chat webhook that receives every alert.
    pub alert_webhook_url: Option<String>,
    // Incident webhook notified when incidents open and resolve.
    pub incident_webhook_url: Option<String>,
    // Analytics ingestion; disabled unless both key and URL are set.
    pub analytics: Option<AnalyticsConfig>,
    // Deployment label attached to every analytics event.
    pub deploy_env: String,
    // Identity of this monitor instance in analytics events.
    pub instance_id: String,
    // Clusters probed on every sweep.
    pub clusters: Vec<ClusterTarget>,
}

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_TRUST_STORE: &str = "/etc/ssl/certs/ca-bundle.crt";
const DEFAULT_DEPLOY_ENV: &str = "testing";
const DEFAULT_INSTANCE_ID: &str = "pulsemon-monitor";
const DEFAULT_PAYLOAD_SIZE: usize = 1024;
const DEFAULT_MESSAGE_COUNT: usize = 5;
const DEFAULT_INCIDENT_CEILING: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalyticsConfig {
    pub api_key: String,
    pub ingestion_url: String,
}

impl AnalyticsConfig {
    /// Both fields present, else `None`.
    pub fn from_parts(api_key: Option<String>, ingestion_url: Option<String>) -> Option<Self> {
        match (api_key, ingestion_url) {
            (Some(api_key), Some(ingestion_url))
                if !api_key.is_empty() && !ingestion_url.is_empty() =>
            {
                Some(Self {
                    api_key,
                    ingestion_url,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    // Consecutive failed sweeps before an incident is opened.
    pub ceiling: u32,
    // Alert on anomalous latencies that are still within budget.
    pub alert_on_anomaly: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_INCIDENT_CEILING,
            alert_on_anomaly: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterTarget {
    // Broker URL, e.g. `pulsar+ssl://useast1.example.io:6651`.
    pub url: String,
    pub topic: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub trust_store: Option<PathBuf>,
    #[serde(default = "default_payload_sizes")]
    pub payload_sizes: Vec<usize>,
    #[serde(default = "default_message_count")]
    pub message_count: usize,
    #[serde(default)]
    pub latency_budget_ms: Option<u64>,
    #[serde(default)]
    pub alert_policy: AlertPolicy,
}

fn default_payload_sizes() -> Vec<usize> {
    vec![DEFAULT_PAYLOAD_SIZE]
}

fn default_message_count() -> usize {
    DEFAULT_MESSAGE_COUNT
}

impl ClusterTarget {
    /// Configured budget; unset or zero falls back to the default.
    pub fn latency_budget(&self) -> Duration {
        self.latency_budget_ms
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LATENCY_BUDGET)
    }

    /// Name used in alerts, incidents and metric labels.
    pub fn name(&self) -> String {
        cluster_name(&self.url).unwrap_or_else(|| self.url.clone())
    }
}

/// Host part of a `scheme://host:port` broker URL.
pub fn cluster_name(url: &str) -> Option<String> {
    let host = url.trim().split(':').nth(1)?.replace("//", "");
    if host.is_empty() { None } else { Some(host) }
}

#[derive(Debug, Deserialize)]
struct MonitorConfigOverride {
    metrics_bind: Option<String>,
    sweep_interval_ms: Option<u64>,
    token: Option<String>,
    trust_store: Option<PathBuf>,
    alert_webhook_url: Option<String>,
    incident_webhook_url: Option<String>,
    analytics: Option<AnalyticsConfig>,
    deploy_env: Option<String>,
    instance_id: Option<String>,
    clusters: Option<Vec<ClusterTarget>>,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let metrics_bind = std::env::var("PULSEMON_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse PULSEMON_METRICS_BIND")?;
        let sweep_interval_ms = std::env::var("PULSEMON_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS);
        let token = std::env::var("PULSEMON_TOKEN")
            .ok()
            .filter(|value| !value.is_empty());
        let trust_store = std::env::var("PULSEMON_TRUST_STORE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_TRUST_STORE));
        let alert_webhook_url = std::env::var("PULSEMON_ALERT_WEBHOOK_URL").ok();
        let incident_webhook_url = std::env::var("PULSEMON_INCIDENT_WEBHOOK_URL").ok();
        let analytics = AnalyticsConfig::from_parts(
            std::env::var("PULSEMON_ANALYTICS_API_KEY").ok(),
            std::env::var("PULSEMON_ANALYTICS_URL").ok(),
        );
        let deploy_env = std::env::var("DeployEnv")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_DEPLOY_ENV.to_string());
        let instance_id = std::env::var("PULSEMON_INSTANCE_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| DEFAULT_INSTANCE_ID.to_string());
        Ok(Self {
            metrics_bind,
            sweep_interval_ms,
            token,
            trust_store,
            alert_webhook_url,
            incident_webhook_url,
            analytics,
            deploy_env,
            instance_id,
            clusters: Vec::new(),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let path = std::env::var("PULSEMON_CONFIG").ok().map(PathBuf::from);
        Self::load(path.as_deref())
    }

    /// Environment defaults, then the YAML file at `path` if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = path {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read monitor config: {}", path.display()))?;
            let override_cfg: MonitorConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse monitor config yaml")?;
            config.apply(override_cfg)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, override_cfg: MonitorConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.sweep_interval_ms
            && value > 0
        {
            self.sweep_interval_ms = value;
        }
        if let Some(value) = override_cfg.token {
            self.token = Some(value);
        }
        if let Some(value) = override_cfg.trust_store {
            self.trust_store = value;
        }
        if let Some(value) = override_cfg.alert_webhook_url {
            self.alert_webhook_url = Some(value);
        }
        if let Some(value) = override_cfg.incident_webhook_url {
            self.incident_webhook_url = Some(value);
        }
        if let Some(value) = override_cfg.analytics {
            self.analytics = AnalyticsConfig::from_parts(Some(value.api_key), Some(value.ingestion_url));
        }
        if let Some(value) = override_cfg.deploy_env {
            self.deploy_env = value;
        }
        if let Some(value) = override_cfg.instance_id {
            self.instance_id = value;
        }
        if let Some(value) = override_cfg.clusters {
            self.clusters = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for cluster in &self.clusters {
            if cluster_name(&cluster.url).is_none() {
                bail!("cluster url {:?} has no host part", cluster.url);
            }
            if cluster.topic.is_empty() {
                bail!("cluster {} has an empty topic", cluster.url);
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
