//! Realtime database REST relay.
//!
//! - Status: `PATCH {base}/devices/{device}.json`
//! - Alerts: `POST {base}/alerts.json`
//!
//! Every request is tried unauthenticated first. A non-2xx answer is retried
//! once with `?auth={api_key}` when a key is configured.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::time::Duration;

use crate::dispatch::{AlertDispatcher, AlertEvent, StatusUpdate};
use crate::SafetyStatus;

#[derive(Clone, Debug)]
pub struct RealtimeDbConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub device_id: String,
    pub model: String,
    pub serial: String,
    pub timeout: Duration,
}

impl Default for RealtimeDbConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            device_id: "MEM001".to_string(),
            model: "SafeEdge Guardian".to_string(),
            serial: "MEM001".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStatusPayload<'a> {
    status: SafetyStatus,
    last_update: u64,
    model: &'a str,
    serial: &'a str,
    children: usize,
    adults: usize,
    children_in_zone: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertPayload<'a> {
    child_id: u64,
    alert_type: &'static str,
    timestamp: u64,
    device_id: &'a str,
}

pub struct RealtimeDbDispatcher {
    config: RealtimeDbConfig,
    base: String,
    agent: ureq::Agent,
}

impl RealtimeDbDispatcher {
    pub fn new(config: RealtimeDbConfig) -> Result<Self> {
        let parsed = url::Url::parse(&config.base_url)
            .with_context(|| format!("invalid realtime database url {}", config.base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "realtime database url must be http(s): {}",
                config.base_url
            ));
        }
        if config.device_id.trim().is_empty() {
            return Err(anyhow!("realtime database device id must not be empty"));
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let base = config.base_url.trim_end_matches('/').to_string();
        log::info!(
            "RealtimeDb: relaying to {} as device {}",
            base,
            config.device_id
        );
        Ok(Self {
            config,
            base,
            agent,
        })
    }

    pub fn status_url(&self) -> String {
        format!("{}/devices/{}.json", self.base, self.config.device_id)
    }

    pub fn alerts_url(&self) -> String {
        format!("{}/alerts.json", self.base)
    }

    fn send<T: Serialize>(&self, method: &str, url: &str, body: &T) -> Result<()> {
        let code = match self.agent.request(method, url).send_json(body) {
            Ok(_) => return Ok(()),
            Err(ureq::Error::Status(code, _)) => code,
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("{} {} failed: {}", method, url, err));
            }
        };

        let Some(key) = self.config.api_key.as_deref() else {
            return Err(anyhow!("{} {} returned {}", method, url, code));
        };
        log::debug!("RealtimeDb: {} returned {}, retrying with auth", url, code);
        match self
            .agent
            .request(method, url)
            .query("auth", key)
            .send_json(body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!(
                "{} {} returned {} (with auth)",
                method,
                url,
                code
            )),
            Err(ureq::Error::Transport(err)) => {
                Err(anyhow!("{} {} failed: {}", method, url, err))
            }
        }
    }
}

impl AlertDispatcher for RealtimeDbDispatcher {
    fn name(&self) -> &str {
        "realtime-db"
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
        let payload = DeviceStatusPayload {
            status: update.status,
            last_update: update.timestamp_ms,
            model: &self.config.model,
            serial: &self.config.serial,
            children: update.counts.children,
            adults: update.counts.adults,
            children_in_zone: update.counts.children_in_zone,
        };
        self.send("PATCH", &self.status_url(), &payload)
    }

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        let payload = AlertPayload {
            child_id: alert.subject.0,
            alert_type: alert.kind.as_str(),
            timestamp: alert.timestamp_ms,
            device_id: &self.config.device_id,
        };
        self.send("POST", &self.alerts_url(), &payload)?;
        log::info!(
            "RealtimeDb: alert {} for child {} delivered",
            alert.kind.as_str(),
            alert.subject
        );
        Ok(())
    }
}
