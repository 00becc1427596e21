use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::ingest::{FrameSourceConfig, SourceSpec};
use crate::pipeline::SessionConfig;
use crate::supervision::SupervisionConfig;
use crate::transport::{MqttConfig, RealtimeDbConfig};

const DEFAULT_SOURCE: &str = "stub://scene";
const DEFAULT_CONFIDENCE: f32 = 0.4;
const DEFAULT_ADULT_MIN_HEIGHT: f32 = 140.0;
const DEFAULT_QUEUE_DEPTH: usize = crate::dispatch::DEFAULT_QUEUE_DEPTH;
/// Subjects are evicted after this many stale thresholds without a sighting.
const EVICTION_STALE_MULTIPLE: u32 = 12;

#[derive(Debug, Deserialize, Default)]
struct GuardianConfigFile {
    source: Option<SourceConfigFile>,
    session: Option<SessionConfigFile>,
    supervision: Option<SupervisionConfigFile>,
    detect: Option<DetectConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    dataset: Option<DatasetConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    capture_fps: Option<u32>,
    stale_secs: Option<f64>,
    refresh_secs: Option<u64>,
    max_consecutive_failures: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    drain_every: Option<u64>,
    drain_frames: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    target_fps: Option<u32>,
    detect_every: Option<u32>,
    frame_reuse_limit: Option<u32>,
    warmup_secs: Option<f64>,
    heartbeat_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisionConfigFile {
    proximity: Option<f32>,
    min_motion: Option<f32>,
    alert_cooldown_ms: Option<u64>,
    eviction_secs: Option<u64>,
    max_subjects: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectConfigFile {
    confidence: Option<f32>,
    scene_path: Option<PathBuf>,
    classifier_weights: Option<PathBuf>,
    adult_min_height: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    kind: Option<String>,
    queue_depth: Option<usize>,
    device_id: Option<String>,
    realtime_db: Option<RealtimeDbConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RealtimeDbConfigFile {
    url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    serial: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    use_tls: Option<bool>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DatasetConfigFile {
    path: Option<PathBuf>,
}

/// Where status and alerts go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Log,
    RealtimeDb,
    Mqtt,
}

impl FromStr for DispatchKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(DispatchKind::Log),
            "realtime-db" | "realtime_db" | "firebase" => Ok(DispatchKind::RealtimeDb),
            "mqtt" => Ok(DispatchKind::Mqtt),
            other => Err(anyhow!(
                "unknown dispatcher '{}' (expected log, realtime-db or mqtt)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub kind: DispatchKind,
    pub queue_depth: usize,
    pub realtime_db: RealtimeDbConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone)]
pub struct DetectSettings {
    /// Minimum tracker confidence for a person to be considered.
    pub confidence: f32,
    /// Scripted scene replayed instead of a live tracker.
    pub scene_path: Option<PathBuf>,
    /// Logistic classifier weights; the height classifier is used without them.
    pub classifier_weights: Option<PathBuf>,
    pub adult_min_height: f32,
}

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub source: String,
    pub capture: FrameSourceConfig,
    pub session: SessionConfig,
    pub supervision: SupervisionConfig,
    pub detect: DetectSettings,
    pub dispatch: DispatchSettings,
    pub dataset_path: Option<PathBuf>,
}

impl GuardianConfig {
    /// Defaults, then the file named by `GUARDIAN_CONFIG`, then `GUARDIAN_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GUARDIAN_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GuardianConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_default();
        let session = file.session.unwrap_or_default();
        let supervision = file.supervision.unwrap_or_default();
        let detect = file.detect.unwrap_or_default();
        let dispatch = file.dispatch.unwrap_or_default();

        let capture_defaults = FrameSourceConfig::default();
        let stale_after = match source.stale_secs {
            Some(secs) => seconds("source.stale_secs", secs)?,
            None => capture_defaults.stale_after,
        };
        let capture = FrameSourceConfig {
            width: source.width.unwrap_or(capture_defaults.width),
            height: source.height.unwrap_or(capture_defaults.height),
            capture_fps: source.capture_fps.unwrap_or(capture_defaults.capture_fps),
            stale_after,
            refresh_interval: source
                .refresh_secs
                .map(Duration::from_secs)
                .unwrap_or(capture_defaults.refresh_interval),
            max_consecutive_failures: source
                .max_consecutive_failures
                .unwrap_or(capture_defaults.max_consecutive_failures),
            reconnect_delay: source
                .reconnect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(capture_defaults.reconnect_delay),
            max_reconnect_attempts: source
                .max_reconnect_attempts
                .unwrap_or(capture_defaults.max_reconnect_attempts),
            drain_every: source.drain_every.unwrap_or(capture_defaults.drain_every),
            drain_frames: source.drain_frames.unwrap_or(capture_defaults.drain_frames),
            ..capture_defaults
        };

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            target_fps: session.target_fps.unwrap_or(session_defaults.target_fps),
            detect_every: session.detect_every.unwrap_or(session_defaults.detect_every),
            frame_reuse_limit: session
                .frame_reuse_limit
                .unwrap_or(session_defaults.frame_reuse_limit),
            warmup: match session.warmup_secs {
                Some(secs) => seconds("session.warmup_secs", secs)?,
                None => session_defaults.warmup,
            },
            heartbeat_frames: session
                .heartbeat_frames
                .unwrap_or(session_defaults.heartbeat_frames),
            ..session_defaults
        };

        let supervision_defaults = SupervisionConfig::default();
        let supervision = SupervisionConfig {
            proximity: supervision.proximity.unwrap_or(supervision_defaults.proximity),
            min_motion: supervision.min_motion.unwrap_or(supervision_defaults.min_motion),
            alert_cooldown: supervision
                .alert_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(supervision_defaults.alert_cooldown),
            eviction_after: supervision
                .eviction_secs
                .map(Duration::from_secs)
                .unwrap_or(stale_after * EVICTION_STALE_MULTIPLE),
            max_subjects: supervision
                .max_subjects
                .unwrap_or(supervision_defaults.max_subjects),
        };

        let detect = DetectSettings {
            confidence: detect.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            scene_path: detect.scene_path,
            classifier_weights: detect.classifier_weights,
            adult_min_height: detect.adult_min_height.unwrap_or(DEFAULT_ADULT_MIN_HEIGHT),
        };

        let realtime_file = dispatch.realtime_db.unwrap_or_default();
        let mqtt_file = dispatch.mqtt.unwrap_or_default();
        let realtime_defaults = RealtimeDbConfig::default();
        let mqtt_defaults = MqttConfig::default();
        let device_id = dispatch
            .device_id
            .unwrap_or_else(|| realtime_defaults.device_id.clone());
        let kind = match dispatch.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => DispatchKind::Log,
        };
        let dispatch = DispatchSettings {
            kind,
            queue_depth: dispatch.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            realtime_db: RealtimeDbConfig {
                base_url: realtime_file.url.unwrap_or_default(),
                api_key: realtime_file.api_key,
                device_id: device_id.clone(),
                model: realtime_file.model.unwrap_or(realtime_defaults.model),
                serial: realtime_file.serial.unwrap_or(realtime_defaults.serial),
                timeout: realtime_defaults.timeout,
            },
            mqtt: MqttConfig {
                broker: mqtt_file.broker.unwrap_or_default(),
                use_tls: mqtt_file.use_tls.unwrap_or(mqtt_defaults.use_tls),
                client_id: mqtt_file.client_id.unwrap_or(mqtt_defaults.client_id),
                topic_prefix: mqtt_file.topic_prefix.unwrap_or(mqtt_defaults.topic_prefix),
                device_id,
                username: mqtt_file.username,
                password: mqtt_file.password,
                keep_alive: mqtt_defaults.keep_alive,
            },
        };

        Ok(Self {
            source: source.url.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            capture,
            session,
            supervision,
            detect,
            dispatch,
            dataset_path: file.dataset.and_then(|dataset| dataset.path),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_value("GUARDIAN_SOURCE") {
            self.source = source;
        }
        if let Some(resolution) = env_value("GUARDIAN_RESOLUTION") {
            let (width, height) = parse_resolution(&resolution)
                .map_err(|e| anyhow!("GUARDIAN_RESOLUTION: {}", e))?;
            self.capture.width = width;
            self.capture.height = height;
        }
        if let Some(fps) = env_value("GUARDIAN_TARGET_FPS") {
            self.session.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("GUARDIAN_TARGET_FPS must be a positive integer"))?;
        }
        if let Some(skip) = env_value("GUARDIAN_SKIP_FRAMES") {
            self.session.detect_every = skip
                .parse()
                .map_err(|_| anyhow!("GUARDIAN_SKIP_FRAMES must be a positive integer"))?;
        }
        if let Some(kind) = env_value("GUARDIAN_DISPATCH") {
            self.dispatch.kind = kind.parse()?;
        }
        if let Some(url) = env_value("GUARDIAN_DB_URL") {
            self.dispatch.realtime_db.base_url = url;
        }
        if let Some(key) = env_value("GUARDIAN_DB_API_KEY") {
            self.dispatch.realtime_db.api_key = Some(key);
        }
        if let Some(device_id) = env_value("GUARDIAN_DEVICE_ID") {
            self.dispatch.realtime_db.device_id = device_id.clone();
            self.dispatch.mqtt.device_id = device_id;
        }
        if let Some(broker) = env_value("GUARDIAN_MQTT_BROKER") {
            self.dispatch.mqtt.broker = broker;
        }
        if let Some(path) = env_value("GUARDIAN_DATASET_PATH") {
            self.dataset_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Check ranges and cross-field requirements. Call again after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        SourceSpec::parse(&self.source)?;
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("resolution must be non-zero"));
        }
        if self.capture.capture_fps == 0 {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        if self.capture.stale_after.is_zero() {
            return Err(anyhow!("stale threshold must be greater than zero"));
        }
        if self.capture.max_consecutive_failures == 0 {
            return Err(anyhow!("max consecutive failures must be greater than zero"));
        }
        if self.session.target_fps == 0 {
            return Err(anyhow!("target fps must be greater than zero"));
        }
        if self.session.detect_every == 0 {
            return Err(anyhow!("skip frames must be greater than zero"));
        }
        if self.session.heartbeat_frames == 0 {
            return Err(anyhow!("heartbeat frames must be greater than zero"));
        }
        if self.supervision.proximity.is_nan() || self.supervision.proximity <= 0.0 {
            return Err(anyhow!("proximity threshold must be positive"));
        }
        if self.supervision.min_motion.is_nan() || self.supervision.min_motion < 0.0 {
            return Err(anyhow!("minimum motion must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.detect.confidence) {
            return Err(anyhow!("confidence must be between 0 and 1"));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(anyhow!("dispatch queue depth must be greater than zero"));
        }
        match self.dispatch.kind {
            DispatchKind::Log => {}
            DispatchKind::RealtimeDb => {
                if self.dispatch.realtime_db.base_url.trim().is_empty() {
                    return Err(anyhow!(
                        "realtime-db dispatcher requires a database url (GUARDIAN_DB_URL)"
                    ));
                }
            }
            DispatchKind::Mqtt => {
                if self.dispatch.mqtt.broker.trim().is_empty() {
                    return Err(anyhow!(
                        "mqtt dispatcher requires a broker address (GUARDIAN_MQTT_BROKER)"
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn source_spec(&self) -> Result<SourceSpec> {
        SourceSpec::parse(&self.source)
    }
}

/// Parse `WIDTHxHEIGHT`, e.g. `480x360`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("resolution must look like 480x360, got '{}'", value))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid resolution width in '{}'", value))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid resolution height in '{}'", value))?;
    if width == 0 || height == 0 {
        return Err(anyhow!("resolution must be non-zero, got '{}'", value));
    }
    Ok((width, height))
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", field))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<GuardianConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
