// Incident bookkeeping per cluster.
// A cluster accumulates consecutive failed sweeps; once the count reaches the
// policy ceiling an incident opens, and the next successful sweep resolves it.
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::AlertPolicy;

#[derive(Debug, Default)]
struct ClusterIncident {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Below the ceiling; no incident yet.
    Pending { failures: u32 },
    /// This failure opened the incident.
    Opened { failures: u32 },
    /// An incident is already open.
    Ongoing { failures: u32 },
}

#[derive(Debug, Default)]
pub struct IncidentTracker {
    clusters: Mutex<HashMap<String, ClusterIncident>>,
}

impl IncidentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, cluster: &str, policy: &AlertPolicy) -> FailureOutcome {
        let mut clusters = self.clusters.lock();
        let state = clusters.entry(cluster.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let failures = state.consecutive_failures;
        if state.opened_at.is_some() {
            return FailureOutcome::Ongoing { failures };
        }
        // A zero ceiling behaves like one.
        if failures >= policy.ceiling.max(1) {
            state.opened_at = Some(Instant::now());
            FailureOutcome::Opened { failures }
        } else {
            FailureOutcome::Pending { failures }
        }
    }

    /// Reset the failure count; returns how long the incident was open, if one was.
    pub fn record_success(&self, cluster: &str) -> Option<Duration> {
        let mut clusters = self.clusters.lock();
        let state = clusters.get_mut(cluster)?;
        state.consecutive_failures = 0;
        state
            .opened_at
            .take()
            .map(|opened_at| opened_at.elapsed())
    }

    pub fn is_open(&self, cluster: &str) -> bool {
        self.clusters
            .lock()
            .get(cluster)
            .is_some_and(|state| state.opened_at.is_some())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum IncidentStatus {
    Open,
    Resolved,
}

#[derive(Debug, Serialize)]
struct IncidentNotice<'a> {
    cluster: &'a str,
    status: IncidentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Posts incident transitions to an external incident webhook.
#[derive(Debug, Clone)]
pub struct IncidentWebhook {
    client: reqwest::Client,
    url: Option<String>,
}

impl IncidentWebhook {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }

    pub async fn open(&self, cluster: &str, title: &str, message: &str) -> Result<()> {
        self.post(IncidentNotice {
            cluster,
            status: IncidentStatus::Open,
            title: Some(title),
            message: Some(message),
        })
        .await
    }

    pub async fn resolve(&self, cluster: &str) -> Result<()> {
        self.post(IncidentNotice {
            cluster,
            status: IncidentStatus::Resolved,
            title: None,
            message: None,
        })
        .await
    }

    async fn post(&self, notice: IncidentNotice<'_>) -> Result<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };
        self.client
            .post(url)
            .json(&notice)
            .send()
            .await
            .context("incident webhook request")?
            .error_for_status()
            .context("incident webhook status")?;
        Ok(())
    }
}
