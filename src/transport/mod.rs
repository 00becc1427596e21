//! Remote relays for status and alerts.
//!
//! - `realtime_db`: JSON REST relay for realtime-database dashboards
//!   (status PATCH per device, alerts POSTed to a shared list).
//! - `mqtt`: status, alerts and availability topics on an MQTT broker.
//!
//! Both implement `dispatch::AlertDispatcher` and block on I/O. The daemon
//! always wraps them in a `QueuedDispatcher`.

pub mod mqtt;
pub mod realtime_db;

pub use mqtt::{parse_mqtt_endpoint, MqttConfig, MqttDispatcher, MqttEndpoint, MqttTopics};
pub use realtime_db::{RealtimeDbConfig, RealtimeDbDispatcher};
