//! Resilient frame source.
//!
//! `FrameSource` isolates the consumer from an unreliable capture backend:
//!
//! - One background producer thread owns the backend exclusively.
//! - The producer is the only writer of a single `FrameSlot`; `read()` copies
//!   out of it and never blocks on the producer.
//! - Stalls, closed handles and runs of failed reads trigger a bounded number
//!   of reconnects. Exhausting them ends the producer for good; this is only
//!   visible through `is_opened()`, `read()` and `stream_health()`.
//! - Network sources are torn down and reopened on a fixed interval, and
//!   their read-ahead buffer is drained periodically.
//!
//! Delivery is at-most-current: readers may see the same frame twice or miss
//! frames the producer overwrote, but never an older frame after a newer one.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{backend_factory, BackendFactory, CaptureBackend, CaptureSettings, SourceSpec};
use crate::frame::{Frame, FrameSlot};

/// Producer policy knobs. Defaults mirror a 480x360 IP camera deployment.
#[derive(Clone, Debug)]
pub struct FrameSourceConfig {
    /// Every published frame is resized to this resolution.
    pub width: u32,
    pub height: u32,
    /// Upper bound on published frames per second (0 = unthrottled).
    pub capture_fps: u32,
    /// No successful frame for this long marks the stream stale.
    pub stale_after: Duration,
    /// Proactive teardown/reopen interval for network sources.
    pub refresh_interval: Duration,
    /// Pause between teardown and reopen on a proactive refresh.
    pub refresh_settle: Duration,
    /// Consecutive failed reads that force a reconnect.
    pub max_consecutive_failures: u32,
    /// Pause between teardown and reopen on a reconnect.
    pub reconnect_delay: Duration,
    /// Reconnects allowed without an intervening good frame before giving up.
    pub max_reconnect_attempts: u32,
    /// Backoff after a failed read that did not trigger a reconnect.
    pub failure_backoff: Duration,
    /// Drain the backend's read-ahead every N published frames (network only, 0 = never).
    pub drain_every: u64,
    /// Frames discarded per drain.
    pub drain_frames: usize,
    /// How long `release()` waits for the producer to observe the stop flag.
    pub release_grace: Duration,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 360,
            capture_fps: 30,
            stale_after: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(300),
            refresh_settle: Duration::from_millis(500),
            max_consecutive_failures: 30,
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            failure_backoff: Duration::from_millis(100),
            drain_every: 10,
            drain_frames: 3,
            release_grace: Duration::from_millis(200),
        }
    }
}

/// Point-in-time diagnostic snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamHealth {
    /// A frame was produced within the stale threshold.
    pub is_healthy: bool,
    /// Since the last good frame (or since start if none yet).
    pub seconds_since_last_frame: f64,
    /// Successful frames published. Never counts failed or reused reads.
    pub frame_count: u64,
    /// Reconnects since the last good frame.
    pub reconnect_attempts: u32,
    /// Total reconnects over the source's lifetime.
    pub total_reconnects: u64,
    /// Producer thread still running.
    pub is_running: bool,
    /// Reconnect attempts were exhausted; the source will not recover.
    pub terminated: bool,
}

#[derive(Debug)]
struct ProducerStats {
    last_success: Option<Instant>,
    frames_produced: u64,
    reconnect_attempts: u32,
    total_reconnects: u64,
}

struct Shared {
    slot: FrameSlot,
    stats: Mutex<ProducerStats>,
    stop: AtomicBool,
    running: AtomicBool,
    terminated: AtomicBool,
    handle_open: AtomicBool,
    started_at: Instant,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, ProducerStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Thread-backed, never-blocking latest-frame source.
pub struct FrameSource {
    label: String,
    config: FrameSourceConfig,
    shared: Arc<Shared>,
    producer: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Start a source for `spec` using the built-in backends.
    pub fn start(spec: &SourceSpec, config: FrameSourceConfig) -> Result<Self> {
        let settings = CaptureSettings {
            width: config.width,
            height: config.height,
            fps: config.capture_fps.max(1),
            timeout: config.stale_after,
        };
        let factory = backend_factory(spec.clone(), settings);
        Self::start_with_factory(spec.to_string(), spec.is_network(), factory, config)
    }

    /// Start a source around an arbitrary backend factory.
    ///
    /// The factory is called once on the producer thread for the initial open
    /// and again for every reconnect or refresh. Returns immediately; the first
    /// frame may not be available yet.
    pub fn start_with_factory(
        label: impl Into<String>,
        is_network: bool,
        factory: BackendFactory,
        config: FrameSourceConfig,
    ) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("frame source resolution must be non-zero"));
        }
        let label = label.into();
        let shared = Arc::new(Shared {
            slot: FrameSlot::new(),
            stats: Mutex::new(ProducerStats {
                last_success: None,
                frames_produced: 0,
                reconnect_attempts: 0,
                total_reconnects: 0,
            }),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            handle_open: AtomicBool::new(false),
            started_at: Instant::now(),
        });

        let producer = Producer {
            label: label.clone(),
            is_network,
            config: config.clone(),
            factory,
            backend: None,
            shared: Arc::clone(&shared),
            consecutive_failures: 0,
            last_refresh: Instant::now(),
        };
        let handle = std::thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || producer.run())
            .map_err(|e| anyhow!("failed to spawn frame source thread: {}", e))?;

        log::info!("FrameSource: started {}", label);
        Ok(Self {
            label,
            config,
            shared,
            producer: Some(handle),
        })
    }

    /// Latest frame as a private copy.
    ///
    /// `None` if no frame was ever produced or the latest one is older than
    /// the stale threshold. Never blocks on the producer.
    pub fn read(&self) -> Option<Frame> {
        let frame = self.shared.slot.snapshot()?;
        if frame.age() > self.config.stale_after {
            return None;
        }
        Some(frame)
    }

    /// True iff the handle reports open and a frame arrived within the stale threshold.
    ///
    /// An open but silently stalled handle reports closed.
    pub fn is_opened(&self) -> bool {
        if self.shared.terminated.load(Ordering::Acquire) {
            return false;
        }
        self.shared.handle_open.load(Ordering::Acquire)
            && self.since_last_frame() < self.config.stale_after
    }

    /// Reconnect attempts were exhausted. Permanent.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn stream_health(&self) -> StreamHealth {
        let (since, frame_count, reconnect_attempts, total_reconnects) = {
            let stats = self.shared.stats();
            let since = stats
                .last_success
                .unwrap_or(self.shared.started_at)
                .elapsed();
            (
                since,
                stats.frames_produced,
                stats.reconnect_attempts,
                stats.total_reconnects,
            )
        };
        StreamHealth {
            is_healthy: since < self.config.stale_after,
            seconds_since_last_frame: since.as_secs_f64(),
            frame_count,
            reconnect_attempts,
            total_reconnects,
            is_running: self.shared.running.load(Ordering::Acquire),
            terminated: self.shared.terminated.load(Ordering::Acquire),
        }
    }

    /// Rough frame rate from the time since the last good frame.
    pub fn estimated_fps(&self) -> f64 {
        let since = self.since_last_frame().as_secs_f64();
        if since > 0.0 {
            1.0 / since
        } else {
            0.0
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop the producer and release the capture handle. Idempotent.
    ///
    /// Waits up to `release_grace` for the producer to exit. A producer blocked
    /// inside a backend read is detached and drops the handle when the read
    /// returns.
    pub fn release(&mut self) {
        let Some(handle) = self.producer.take() else {
            return;
        };
        log::info!("FrameSource: releasing {}", self.label);
        self.shared.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + self.config.release_grace;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("FrameSource: producer for {} panicked", self.label);
            }
        } else {
            log::warn!(
                "FrameSource: producer for {} still busy after {:?}; detaching",
                self.label,
                self.config.release_grace
            );
        }
        self.shared.slot.clear();
    }

    fn since_last_frame(&self) -> Duration {
        self.shared
            .stats()
            .last_success
            .unwrap_or(self.shared.started_at)
            .elapsed()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Producer
// ----------------------------------------------------------------------------

enum Reconnect {
    Reopened,
    StillClosed,
    Exhausted,
}

struct Producer {
    label: String,
    is_network: bool,
    config: FrameSourceConfig,
    factory: BackendFactory,
    backend: Option<Box<dyn CaptureBackend>>,
    shared: Arc<Shared>,
    consecutive_failures: u32,
    last_refresh: Instant,
}

impl Producer {
    fn run(mut self) {
        self.open();

        while !self.stopped() {
            if self.is_network && self.last_refresh.elapsed() > self.config.refresh_interval {
                self.refresh();
                continue;
            }

            let opened = self.backend.as_ref().map(|b| b.is_opened()).unwrap_or(false);
            self.shared.handle_open.store(opened, Ordering::Release);
            if !opened {
                match self.reconnect("handle closed") {
                    Reconnect::Exhausted => break,
                    Reconnect::Reopened | Reconnect::StillClosed => continue,
                }
            }

            let result = match self.backend.as_mut() {
                Some(backend) => backend.read(),
                None => Err(anyhow!("no capture handle")),
            };
            match result.and_then(|frame| frame.resized(self.config.width, self.config.height)) {
                Ok(frame) => self.publish(frame),
                Err(err) => {
                    if !self.on_failure(err) {
                        break;
                    }
                }
            }
        }

        self.backend = None;
        self.shared.handle_open.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        log::info!("FrameSource: producer for {} stopped", self.label);
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn open(&mut self) {
        match (self.factory)() {
            Ok(backend) => {
                log::info!(
                    "FrameSource: opened {} via {} backend",
                    self.label,
                    backend.name()
                );
                self.shared
                    .handle_open
                    .store(backend.is_opened(), Ordering::Release);
                self.backend = Some(backend);
            }
            Err(err) => {
                log::warn!("FrameSource: failed to open {}: {:#}", self.label, err);
                self.backend = None;
                self.shared.handle_open.store(false, Ordering::Release);
            }
        }
    }

    fn publish(&mut self, mut frame: Frame) {
        let sequence = {
            let mut stats = self.shared.stats();
            stats.frames_produced += 1;
            stats.frames_produced
        };
        frame.sequence = sequence;
        self.shared.slot.store(frame);
        {
            let mut stats = self.shared.stats();
            stats.last_success = Some(Instant::now());
            stats.reconnect_attempts = 0;
        }
        self.consecutive_failures = 0;

        if self.config.capture_fps > 0 {
            self.sleep(Duration::from_millis(1000 / self.config.capture_fps as u64));
        }

        if self.is_network
            && self.config.drain_every > 0
            && sequence % self.config.drain_every == 0
        {
            if let Some(backend) = self.backend.as_mut() {
                backend.drain(self.config.drain_frames);
            }
        }
    }

    /// Handle a failed read. Returns false when the producer must stop.
    fn on_failure(&mut self, err: anyhow::Error) -> bool {
        self.consecutive_failures += 1;
        log::debug!(
            "FrameSource: read failed on {} ({} in a row): {:#}",
            self.label,
            self.consecutive_failures,
            err
        );

        let since_success = self
            .shared
            .stats()
            .last_success
            .unwrap_or(self.shared.started_at)
            .elapsed();
        let reason = if since_success > self.config.stale_after {
            log::warn!(
                "FrameSource: {} stale ({:.1}s since last frame)",
                self.label,
                since_success.as_secs_f64()
            );
            Some("stream stale")
        } else if self.consecutive_failures >= self.config.max_consecutive_failures {
            log::warn!(
                "FrameSource: too many frame failures on {} ({})",
                self.label,
                self.consecutive_failures
            );
            Some("consecutive read failures")
        } else {
            None
        };

        if let Some(reason) = reason {
            self.consecutive_failures = 0;
            if let Reconnect::Exhausted = self.reconnect(reason) {
                return false;
            }
            return true;
        }

        self.sleep(self.config.failure_backoff);
        true
    }

    fn reconnect(&mut self, reason: &str) -> Reconnect {
        let attempt = {
            let mut stats = self.shared.stats();
            if stats.reconnect_attempts >= self.config.max_reconnect_attempts {
                None
            } else {
                stats.reconnect_attempts += 1;
                stats.total_reconnects += 1;
                Some(stats.reconnect_attempts)
            }
        };
        let Some(attempt) = attempt else {
            log::error!(
                "FrameSource: max reconnection attempts ({}) reached for {}; giving up",
                self.config.max_reconnect_attempts,
                self.label
            );
            self.shared.terminated.store(true, Ordering::Release);
            return Reconnect::Exhausted;
        };

        log::warn!(
            "FrameSource: reconnecting to {} after {} (attempt {}/{})",
            self.label,
            reason,
            attempt,
            self.config.max_reconnect_attempts
        );
        self.backend = None;
        self.shared.handle_open.store(false, Ordering::Release);
        self.sleep(self.config.reconnect_delay);
        if self.stopped() {
            return Reconnect::StillClosed;
        }
        self.open();

        if self.backend.as_ref().map(|b| b.is_opened()).unwrap_or(false) {
            log::info!("FrameSource: reconnected to {}", self.label);
            Reconnect::Reopened
        } else {
            Reconnect::StillClosed
        }
    }

    fn refresh(&mut self) {
        log::info!("FrameSource: refreshing stream connection to {}", self.label);
        self.backend = None;
        self.shared.handle_open.store(false, Ordering::Release);
        self.sleep(self.config.refresh_settle);
        self.last_refresh = Instant::now();
        if self.stopped() {
            return;
        }
        self.open();
        self.shared.stats().reconnect_attempts = 0;
    }

    /// Sleep in short slices so a stop request is observed promptly.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> FrameSourceConfig {
        FrameSourceConfig {
            width: 32,
            height: 24,
            capture_fps: 0,
            stale_after: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(1),
            failure_backoff: Duration::from_millis(1),
            ..FrameSourceConfig::default()
        }
    }

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn synthetic_source_publishes_resized_frames() -> Result<()> {
        let spec = SourceSpec::parse("stub://scene")?;
        let mut source = FrameSource::start(
            &spec,
            FrameSourceConfig {
                capture_fps: 100,
                ..fast_config()
            },
        )?;

        assert!(wait_for(Duration::from_secs(2), || source.read().is_some()));
        let frame = source.read().expect("frame");
        assert_eq!(frame.dimensions(), (32, 24));
        assert!(source.is_opened());
        assert!(source.stream_health().is_healthy);

        source.release();
        source.release();
        assert!(!source.stream_health().is_running);
        assert!(source.read().is_none());
        Ok(())
    }

    #[test]
    fn read_before_first_frame_is_none() -> Result<()> {
        let factory: BackendFactory = Box::new(|| Err(anyhow!("camera unplugged")));
        let mut source = FrameSource::start_with_factory(
            "unplugged",
            false,
            factory,
            FrameSourceConfig {
                reconnect_delay: Duration::from_millis(200),
                ..fast_config()
            },
        )?;
        assert!(source.read().is_none());
        assert!(!source.is_opened());
        source.release();
        Ok(())
    }

    #[test]
    fn frame_count_increases_only_on_success() -> Result<()> {
        let spec = SourceSpec::parse("stub://scene?fail_every=2")?;
        let mut source = FrameSource::start(&spec, fast_config())?;
        assert!(wait_for(Duration::from_secs(2), || {
            source.stream_health().frame_count >= 5
        }));
        source.release();

        let produced = source.stream_health().frame_count;
        let last_seq = source.shared.slot.snapshot().map(|f| f.sequence);
        assert!(last_seq.is_none(), "release clears the slot");
        assert!(produced >= 5);
        Ok(())
    }
}
