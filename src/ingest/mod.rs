//! Frame ingestion.
//!
//! This module provides the capture backends and the resilient `FrameSource`
//! built on top of them:
//! - Synthetic scenes (`stub://`, tests and demos)
//! - HTTP MJPEG / JPEG snapshot streams (IP cameras, phone webcam apps)
//! - Local files and RTSP streams (feature: ingest-ffmpeg)
//! - Local capture devices by index (feature: ingest-v4l2)
//!
//! A backend is a plain, blocking capture handle. It knows nothing about
//! reconnects, staleness, or threads; `source::FrameSource` owns all of that
//! and is the only code that ever holds a backend.

#[cfg(feature = "ingest-ffmpeg")]
pub mod ffmpeg;
pub mod mjpeg;
pub mod source;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::fmt;
use std::time::Duration;

use crate::frame::Frame;

pub use mjpeg::MjpegBackend;
pub use source::{FrameSource, FrameSourceConfig, StreamHealth};
pub use synthetic::SyntheticBackend;

/// A blocking capture handle.
///
/// Dropping the backend releases the underlying device or connection.
pub trait CaptureBackend: Send {
    /// Human-readable backend identifier for logs.
    fn name(&self) -> &'static str;

    /// True while the handle believes it can still deliver frames.
    fn is_opened(&self) -> bool;

    /// Read one decoded frame. May block up to the backend's read timeout.
    fn read(&mut self) -> Result<Frame>;

    /// Discard up to `max_frames` frames buffered ahead of real time.
    ///
    /// Backends without read-ahead keep the default no-op.
    fn drain(&mut self, max_frames: usize) {
        let _ = max_frames;
    }
}

/// Opens a fresh backend with identical configuration on every call.
pub type BackendFactory = Box<dyn FnMut() -> Result<Box<dyn CaptureBackend>> + Send>;

/// Where frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// Local capture device by index (`0` → `/dev/video0`).
    Device(u32),
    /// Local video file.
    File(String),
    /// Network stream URL (http(s) MJPEG, rtsp, rtmp, udp).
    Stream(String),
    /// Synthetic scene (`stub://name`).
    Synthetic(String),
}

impl SourceSpec {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(anyhow!("video source must not be empty"));
        }
        if source.chars().all(|c| c.is_ascii_digit()) {
            let index = source
                .parse()
                .map_err(|_| anyhow!("device index out of range: {}", source))?;
            return Ok(Self::Device(index));
        }
        if let Some(name) = source.strip_prefix("stub://") {
            return Ok(Self::Synthetic(name.to_string()));
        }
        if let Some((scheme, _)) = source.split_once("://") {
            return match scheme.to_ascii_lowercase().as_str() {
                "http" | "https" | "rtsp" | "rtsps" | "rtmp" | "udp" => {
                    Ok(Self::Stream(source.to_string()))
                }
                "file" => Ok(Self::File(source["file://".len()..].to_string())),
                other => Err(anyhow!("unsupported video source scheme '{}'", other)),
            };
        }
        Ok(Self::File(source.to_string()))
    }

    /// Network sources get proactive refresh and read-ahead draining.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    fn is_http(&self) -> bool {
        match self {
            Self::Stream(url) => {
                let lower = url.to_ascii_lowercase();
                lower.starts_with("http://") || lower.starts_with("https://")
            }
            _ => false,
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device {}", index),
            Self::File(path) => write!(f, "file {}", path),
            Self::Stream(url) => write!(f, "{}", url),
            Self::Synthetic(name) => write!(f, "stub://{}", name),
        }
    }
}

/// Settings handed to a backend on open.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Resolution requested from the device (frames are resized again by the source).
    pub width: u32,
    pub height: u32,
    /// Frame rate requested from the device.
    pub fps: u32,
    /// Open/read timeout for network and device handles.
    pub timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 480,
            height: 360,
            fps: 10,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Open a backend for `spec`.
pub fn open_backend(spec: &SourceSpec, settings: &CaptureSettings) -> Result<Box<dyn CaptureBackend>> {
    match spec {
        SourceSpec::Synthetic(name) => Ok(Box::new(SyntheticBackend::new(name, settings))),
        SourceSpec::Stream(url) if spec.is_http() => {
            Ok(Box::new(MjpegBackend::connect(url, settings)?))
        }
        SourceSpec::Stream(url) => open_ffmpeg(url, settings),
        SourceSpec::File(path) => open_ffmpeg(path, settings),
        SourceSpec::Device(index) => open_device(*index, settings),
    }
}

/// Factory that reopens `spec` with the same settings on every call.
pub fn backend_factory(spec: SourceSpec, settings: CaptureSettings) -> BackendFactory {
    Box::new(move || open_backend(&spec, &settings))
}

#[cfg(feature = "ingest-ffmpeg")]
fn open_ffmpeg(location: &str, settings: &CaptureSettings) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(ffmpeg::FfmpegBackend::open(location, settings)?))
}

#[cfg(not(feature = "ingest-ffmpeg"))]
fn open_ffmpeg(location: &str, _settings: &CaptureSettings) -> Result<Box<dyn CaptureBackend>> {
    Err(anyhow!(
        "{} requires the ingest-ffmpeg feature",
        location
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, settings: &CaptureSettings) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(v4l2::V4l2Backend::open(index, settings)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _settings: &CaptureSettings) -> Result<Box<dyn CaptureBackend>> {
    Err(anyhow!(
        "capture device {} requires the ingest-v4l2 feature",
        index
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_index() {
        assert_eq!(SourceSpec::parse("0").unwrap(), SourceSpec::Device(0));
        assert_eq!(SourceSpec::parse(" 2 ").unwrap(), SourceSpec::Device(2));
    }

    #[test]
    fn parses_network_streams() {
        let spec = SourceSpec::parse("http://172.18.132.254:8080/video").unwrap();
        assert!(spec.is_network());
        assert!(spec.is_http());

        let spec = SourceSpec::parse("rtsp://camera/stream").unwrap();
        assert!(spec.is_network());
        assert!(!spec.is_http());
    }

    #[test]
    fn parses_files_and_stubs() {
        assert_eq!(
            SourceSpec::parse("clips/playground.mp4").unwrap(),
            SourceSpec::File("clips/playground.mp4".to_string())
        );
        assert_eq!(
            SourceSpec::parse("file:///tmp/a.mp4").unwrap(),
            SourceSpec::File("/tmp/a.mp4".to_string())
        );
        let stub = SourceSpec::parse("stub://scene").unwrap();
        assert_eq!(stub, SourceSpec::Synthetic("scene".to_string()));
        assert!(!stub.is_network());
    }

    #[test]
    fn rejects_unknown_schemes_and_empty() {
        assert!(SourceSpec::parse("").is_err());
        assert!(SourceSpec::parse("gopher://x").is_err());
    }

    #[test]
    fn factory_reopens_synthetic_backends() -> Result<()> {
        let mut factory = backend_factory(
            SourceSpec::Synthetic("scene".to_string()),
            CaptureSettings::default(),
        );
        let mut first = factory()?;
        let mut second = factory()?;
        assert!(first.is_opened());
        assert_eq!(first.read()?.dimensions(), (480, 360));
        assert_eq!(second.read()?.dimensions(), (480, 360));
        Ok(())
    }
}
