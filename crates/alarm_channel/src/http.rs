use std::time::Duration;

use anyhow::{bail, Context, Result};
use core_types::{Notifier, Severity};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

/// Client name reported to the monitoring endpoint.
pub const CLIENT_NAME: &str = "L2-client";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpNotifierConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpNotifierConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:50000/monitoring/log".to_string(),
            timeout_ms: 2_000,
            username: None,
            password: None,
        }
    }
}

/// Posts each alarm as a form to the monitoring log endpoint.
pub struct HttpNotifier {
    http: Client,
    cfg: HttpNotifierConfig,
}

impl HttpNotifier {
    pub fn new(cfg: HttpNotifierConfig) -> Result<Self> {
        if cfg.url.trim().is_empty() {
            bail!("alarm endpoint url is empty");
        }
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1)))
            .build()
            .context("build alarm http client")?;
        Ok(Self { http, cfg })
    }

    pub fn url(&self) -> &str {
        &self.cfg.url
    }
}

impl Notifier for HttpNotifier {
    fn notify(&mut self, severity: Severity, message: &str) -> Result<()> {
        let level = severity.level().to_string();
        let form = [("name", CLIENT_NAME), ("level", level.as_str()), ("message", message)];
        let mut req = self.http.post(&self.cfg.url).form(&form);
        if let Some(password) = &self.cfg.password {
            let user = self.cfg.username.as_deref().unwrap_or(CLIENT_NAME);
            req = req.basic_auth(user, Some(password));
        }
        let res = req
            .send()
            .with_context(|| format!("post alarm to {}", self.cfg.url))?;
        if !res.status().is_success() {
            bail!("alarm endpoint rejected message: {}", res.status());
        }
        Ok(())
    }
}

/// Silent-mode notifier: alarms reach the local log only.
#[derive(Debug, Default)]
pub struct LogNotifier {
    delivered: u64,
}

impl LogNotifier {
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl Notifier for LogNotifier {
    fn notify(&mut self, severity: Severity, message: &str) -> Result<()> {
        self.delivered += 1;
        tracing::trace!(%severity, alarm = message, "alarm not forwarded (silent mode)");
        Ok(())
    }
}
