// Alert delivery to a chat webhook.
use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct AlertMessage<'a> {
    text: &'a str,
}

#[derive(Debug, Clone)]
pub struct AlertWebhook {
    client: reqwest::Client,
    url: Option<String>,
}

impl AlertWebhook {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    pub async fn send(&self, message: &str) -> Result<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };
        self.client
            .post(url)
            .json(&AlertMessage { text: message })
            .send()
            .await
            .context("alert webhook request")?
            .error_for_status()
            .context("alert webhook status")?;
        Ok(())
    }
}
