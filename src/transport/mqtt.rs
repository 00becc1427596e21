//! MQTT relay.
//!
//! Topics under `{prefix}/{device}`:
//! - `status`: retained JSON status snapshot
//! - `alerts`: one JSON message per danger zone entry
//! - `availability`: retained `online` / `offline`, with `offline` as last will
//!
//! All publishes use QoS 1.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::dispatch::{AlertDispatcher, AlertEvent, StatusUpdate};
use crate::{SafetyStatus, StatusCounts};

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

// ----------------------------------------------------------------------------
// Endpoint parsing
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse a broker address.
///
/// Accepts `host:port`, `[ipv6]:port`, and the `mqtt://`, `tcp://` (plain) or
/// `mqtts://`, `ssl://` (TLS) schemes in front of either.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

// ----------------------------------------------------------------------------
// Topics and payloads
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttTopics {
    pub status: String,
    pub alerts: String,
    pub availability: String,
}

impl MqttTopics {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        let base = format!("{}/{}", prefix.trim_end_matches('/'), device_id);
        Self {
            status: format!("{}/status", base),
            alerts: format!("{}/alerts", base),
            availability: format!("{}/availability", base),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload<'a> {
    device_id: &'a str,
    status: SafetyStatus,
    #[serde(flatten)]
    counts: StatusCounts,
    last_update: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertPayload<'a> {
    device_id: &'a str,
    child_id: u64,
    alert_type: &'static str,
    timestamp: u64,
}

fn status_payload(device_id: &str, update: &StatusUpdate) -> Result<Vec<u8>> {
    serde_json::to_vec(&StatusPayload {
        device_id,
        status: update.status,
        counts: update.counts,
        last_update: update.timestamp_ms,
    })
    .context("serialize MQTT status payload")
}

fn alert_payload(device_id: &str, alert: &AlertEvent) -> Result<Vec<u8>> {
    serde_json::to_vec(&AlertPayload {
        device_id,
        child_id: alert.subject.0,
        alert_type: alert.kind.as_str(),
        timestamp: alert.timestamp_ms,
    })
    .context("serialize MQTT alert payload")
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub broker: String,
    pub use_tls: bool,
    pub client_id: String,
    pub topic_prefix: String,
    pub device_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1:1883".to_string(),
            use_tls: false,
            client_id: "guardiand".to_string(),
            topic_prefix: "guardian".to_string(),
            device_id: "MEM001".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
        }
    }
}

pub struct MqttDispatcher {
    client: Client,
    topics: MqttTopics,
    device_id: String,
    closing: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttDispatcher {
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&config.broker, config.use_tls)?;
        let topics = MqttTopics::new(&config.topic_prefix, &config.device_id);

        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = config.username.as_deref() {
            options.set_credentials(user, config.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &topics.availability,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(if endpoint.use_tls {
            Transport::tls_with_default_config()
        } else {
            Transport::tcp()
        });

        let (client, connection) = Client::new(options, 10);
        let closing = Arc::new(AtomicBool::new(false));
        let connection_handle = spawn_connection(connection, Arc::clone(&closing))?;

        client
            .publish(
                &topics.availability,
                QoS::AtLeastOnce,
                true,
                PAYLOAD_ONLINE.as_bytes().to_vec(),
            )
            .context("publish MQTT availability")?;
        log::info!(
            "Mqtt: connected to {}:{} (TLS: {}, auth: {}), publishing under {}",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            config.username.is_some(),
            topics.status.trim_end_matches("/status")
        );

        Ok(Self {
            client,
            topics,
            device_id: config.device_id.clone(),
            closing,
            connection_handle: Some(connection_handle),
        })
    }

    pub fn topics(&self) -> &MqttTopics {
        &self.topics
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .with_context(|| format!("publish to {}", topic))
    }
}

/// Drive the MQTT event loop until the dispatcher closes.
///
/// rumqttc reconnects on the next poll after an error.
fn spawn_connection(mut connection: Connection, closing: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            let mut failing = false;
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {
                        if failing {
                            log::info!("Mqtt: connection restored");
                            failing = false;
                        }
                    }
                    Err(e) => {
                        if closing.load(Ordering::Acquire) {
                            break;
                        }
                        if !failing {
                            log::warn!("Mqtt: connection error: {}", e);
                            failing = true;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })
        .map_err(|e| anyhow!("failed to spawn MQTT connection thread: {}", e))
}

impl AlertDispatcher for MqttDispatcher {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
        let payload = status_payload(&self.device_id, update)?;
        self.publish(&self.topics.status, payload, true)
    }

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        let payload = alert_payload(&self.device_id, alert)?;
        self.publish(&self.topics.alerts, payload, false)
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.connection_handle.take() else {
            return Ok(());
        };
        self.closing.store(true, Ordering::Release);
        let offline = self.publish(
            &self.topics.availability,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            true,
        );
        let disconnect = self.client.disconnect().context("disconnect MQTT client");
        let _ = handle.join();
        offline.and(disconnect)
    }
}
