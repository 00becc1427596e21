//! Status relay and alert dispatch.
//!
//! - `StatusRelay` decides *when* a status is pushed: on change, or as a
//!   heartbeat after a fixed number of frames.
//! - `AlertDispatcher` is the delivery contract implemented by the remote
//!   relays in `transport` and by `LogDispatcher`.
//! - `QueuedDispatcher` moves delivery onto a worker thread behind a bounded
//!   queue so a slow or dead relay never stalls the decision loop.
//! - `FanoutDispatcher` delivers to several relays.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::{unix_millis, AlertKind, SafetyStatus, StatusCounts, TrackId};

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: SafetyStatus,
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub timestamp_ms: u64,
}

impl StatusUpdate {
    pub fn now(status: SafetyStatus, counts: StatusCounts) -> Self {
        Self {
            status,
            counts,
            timestamp_ms: unix_millis(),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub subject: TrackId,
    pub kind: AlertKind,
    pub timestamp_ms: u64,
}

impl AlertEvent {
    pub fn zone_entry(subject: TrackId) -> Self {
        Self {
            subject,
            kind: AlertKind::DangerZoneEntry,
            timestamp_ms: unix_millis(),
        }
    }
}

// ----------------------------------------------------------------------------
// Contract
// ----------------------------------------------------------------------------

/// Delivery target for status snapshots and alerts.
///
/// Implementations may block on I/O; callers that must not block wrap them in
/// a `QueuedDispatcher`.
pub trait AlertDispatcher: Send {
    fn name(&self) -> &str;

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()>;

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()>;

    /// Flush and disconnect. Called once when the session ends.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// StatusRelay
// ----------------------------------------------------------------------------

/// Change-or-heartbeat push cadence.
#[derive(Clone, Debug)]
pub struct StatusRelay {
    heartbeat_frames: u32,
    last_relayed: Option<SafetyStatus>,
    frames_since_push: u32,
}

impl StatusRelay {
    pub fn new(heartbeat_frames: u32) -> Self {
        Self {
            heartbeat_frames: heartbeat_frames.max(1),
            last_relayed: None,
            frames_since_push: 0,
        }
    }

    /// Count one frame carrying `status`. True if it must be pushed now.
    pub fn observe(&mut self, status: SafetyStatus) -> bool {
        self.frames_since_push = self.frames_since_push.saturating_add(1);
        let changed = self.last_relayed != Some(status);
        if changed || self.frames_since_push >= self.heartbeat_frames {
            self.last_relayed = Some(status);
            self.frames_since_push = 0;
            return true;
        }
        false
    }

    pub fn last_relayed(&self) -> Option<SafetyStatus> {
        self.last_relayed
    }

    pub fn reset(&mut self) {
        self.last_relayed = None;
        self.frames_since_push = 0;
    }
}

// ----------------------------------------------------------------------------
// Error streak latch
// ----------------------------------------------------------------------------

/// Logs the first failure of a streak at `warn`, the rest at `debug`.
#[derive(Debug, Default)]
pub(crate) struct ErrorLatch {
    failing: bool,
    suppressed: u64,
}

impl ErrorLatch {
    pub(crate) fn record(&mut self, target: &str, what: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                if self.failing {
                    log::info!(
                        "{}: delivery recovered after {} further failures",
                        target,
                        self.suppressed
                    );
                }
                self.failing = false;
                self.suppressed = 0;
            }
            Err(err) if !self.failing => {
                log::warn!("{}: {} failed: {:#}", target, what, err);
                self.failing = true;
            }
            Err(err) => {
                self.suppressed += 1;
                log::debug!("{}: {} failed: {:#}", target, what, err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// QueuedDispatcher
// ----------------------------------------------------------------------------

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// How long a closing queue keeps delivering before discarding the rest.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

enum Message {
    Status(StatusUpdate),
    Alert(AlertEvent),
}

/// Fire-and-forget wrapper: enqueue, never wait for delivery.
///
/// A full queue drops the message. Closing (or dropping) the wrapper keeps
/// delivering queued messages for at most the close grace, discards the
/// rest, closes the inner dispatcher and joins the worker.
pub struct QueuedDispatcher {
    name: String,
    sender: Option<SyncSender<Message>>,
    worker: Option<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
    dropped: u64,
}

impl QueuedDispatcher {
    pub fn spawn(inner: Box<dyn AlertDispatcher>, depth: usize) -> Result<Self> {
        Self::spawn_with_grace(inner, depth, DEFAULT_CLOSE_GRACE)
    }

    pub fn spawn_with_grace(
        inner: Box<dyn AlertDispatcher>,
        depth: usize,
        close_grace: Duration,
    ) -> Result<Self> {
        let name = format!("queued({})", inner.name());
        let (sender, receiver) = mpsc::sync_channel(depth.max(1));
        let closing = Arc::new(AtomicBool::new(false));
        let worker = {
            let closing = Arc::clone(&closing);
            std::thread::Builder::new()
                .name("alert-dispatch".to_string())
                .spawn(move || deliver(inner, receiver, &closing, close_grace))
                .map_err(|e| anyhow!("failed to spawn dispatch worker: {}", e))?
        };
        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            closing,
            dropped: 0,
        })
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn enqueue(&mut self, message: Message) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("{} is closed", self.name))?;
        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                log::debug!("{}: queue full, message dropped ({} total)", self.name, self.dropped);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(anyhow!("{} worker has stopped", self.name))
            }
        }
    }

    fn shutdown(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{}: dispatch worker panicked", self.name);
            }
        }
    }
}

fn deliver(
    mut inner: Box<dyn AlertDispatcher>,
    receiver: Receiver<Message>,
    closing: &AtomicBool,
    close_grace: Duration,
) {
    let target = inner.name().to_string();
    let mut latch = ErrorLatch::default();
    let mut close_deadline: Option<Instant> = None;
    let mut discarded = 0u64;
    for message in receiver {
        if closing.load(Ordering::Acquire) {
            let deadline = *close_deadline.get_or_insert_with(|| Instant::now() + close_grace);
            if Instant::now() >= deadline {
                discarded += 1;
                continue;
            }
        }
        match message {
            Message::Status(update) => {
                let result = inner.update_status(&update);
                latch.record(&target, "status update", result);
            }
            Message::Alert(alert) => {
                let result = inner.send_alert(&alert);
                latch.record(&target, "alert", result);
            }
        }
    }
    if discarded > 0 {
        log::warn!("{}: discarded {} undelivered messages on close", target, discarded);
    }
    if let Err(err) = inner.close() {
        log::warn!("{}: close failed: {:#}", target, err);
    }
}

impl AlertDispatcher for QueuedDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
        self.enqueue(Message::Status(update.clone()))
    }

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        self.enqueue(Message::Alert(alert.clone()))
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for QueuedDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// LogDispatcher / FanoutDispatcher
// ----------------------------------------------------------------------------

/// Writes status and alerts to the log. Never fails.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl AlertDispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
        log::info!(
            "status: {} (children={}, adults={}, in_zone={})",
            update.status,
            update.counts.children,
            update.counts.adults,
            update.counts.children_in_zone
        );
        Ok(())
    }

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        log::warn!("ALERT: {} for child {}", alert.kind.as_str(), alert.subject);
        Ok(())
    }
}

/// Delivers every message to all targets; one failing target does not stop the others.
pub struct FanoutDispatcher {
    targets: Vec<Box<dyn AlertDispatcher>>,
}

impl FanoutDispatcher {
    pub fn new(targets: Vec<Box<dyn AlertDispatcher>>) -> Self {
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn each(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut dyn AlertDispatcher) -> Result<()>,
    ) -> Result<()> {
        let mut failed = Vec::new();
        for target in self.targets.iter_mut() {
            if let Err(err) = op(target.as_mut()) {
                failed.push(format!("{}: {:#}", target.name(), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} failed for {}", what, failed.join("; ")))
        }
    }
}

impl AlertDispatcher for FanoutDispatcher {
    fn name(&self) -> &str {
        "fanout"
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
        self.each("status update", |t| t.update_status(update))
    }

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        self.each("alert", |t| t.send_alert(alert))
    }

    fn close(&mut self) -> Result<()> {
        self.each("close", |t| t.close())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        statuses: Vec<SafetyStatus>,
        alerts: Vec<TrackId>,
        closed: bool,
    }

    struct Recorder {
        log: Arc<Mutex<Recorded>>,
        fail: bool,
        delay: Duration,
    }

    impl AlertDispatcher for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(anyhow!("relay offline"));
            }
            self.log.lock().unwrap().statuses.push(update.status);
            Ok(())
        }

        fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
            if self.fail {
                return Err(anyhow!("relay offline"));
            }
            self.log.lock().unwrap().alerts.push(alert.subject);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.log.lock().unwrap().closed = true;
            Ok(())
        }
    }

    fn recorder(fail: bool, delay: Duration) -> (Box<dyn AlertDispatcher>, Arc<Mutex<Recorded>>) {
        let log = Arc::new(Mutex::new(Recorded::default()));
        (
            Box::new(Recorder {
                log: Arc::clone(&log),
                fail,
                delay,
            }),
            log,
        )
    }

    #[test]
    fn relay_pushes_on_change_and_heartbeat() {
        let mut relay = StatusRelay::new(3);
        assert!(relay.observe(SafetyStatus::Safe), "first frame always pushes");
        assert!(!relay.observe(SafetyStatus::Safe));
        assert!(!relay.observe(SafetyStatus::Safe));
        assert!(relay.observe(SafetyStatus::Safe), "heartbeat after 3 frames");
        assert!(relay.observe(SafetyStatus::Danger), "change pushes immediately");
        assert!(!relay.observe(SafetyStatus::Danger));
        relay.reset();
        assert_eq!(relay.last_relayed(), None);
        assert!(relay.observe(SafetyStatus::Danger));
    }

    #[test]
    fn status_update_serializes_flat_camel_case() {
        let update = StatusUpdate {
            status: SafetyStatus::Danger,
            counts: StatusCounts {
                children: 1,
                adults: 0,
                children_in_zone: 1,
            },
            timestamp_ms: 42,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], "danger");
        assert_eq!(json["childrenInZone"], 1);
        assert_eq!(json["timestampMs"], 42);
    }

    #[test]
    fn queued_dispatcher_delivers_in_order_and_closes_inner() -> Result<()> {
        let (inner, log) = recorder(false, Duration::ZERO);
        let mut queued = QueuedDispatcher::spawn(inner, 16)?;
        queued.update_status(&StatusUpdate::now(SafetyStatus::Safe, StatusCounts::default()))?;
        queued.send_alert(&AlertEvent::zone_entry(TrackId(4)))?;
        queued.update_status(&StatusUpdate::now(SafetyStatus::Danger, StatusCounts::default()))?;
        queued.close()?;

        let log = log.lock().unwrap();
        assert_eq!(log.statuses, vec![SafetyStatus::Safe, SafetyStatus::Danger]);
        assert_eq!(log.alerts, vec![TrackId(4)]);
        assert!(log.closed);
        Ok(())
    }

    #[test]
    fn queued_dispatcher_never_blocks_on_slow_relay() -> Result<()> {
        let (inner, _log) = recorder(false, Duration::from_millis(200));
        let mut queued = QueuedDispatcher::spawn(inner, 1)?;
        let started = std::time::Instant::now();
        for _ in 0..10 {
            queued.update_status(&StatusUpdate::now(SafetyStatus::Safe, StatusCounts::default()))?;
        }
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(queued.dropped() >= 1);
        Ok(())
    }

    #[test]
    fn close_gives_up_on_a_dead_relay_after_the_grace() -> Result<()> {
        let (inner, log) = recorder(true, Duration::from_millis(50));
        let mut queued = QueuedDispatcher::spawn_with_grace(inner, 64, Duration::from_millis(100))?;
        for _ in 0..40 {
            queued.update_status(&StatusUpdate::now(SafetyStatus::Danger, StatusCounts::default()))?;
        }
        let started = std::time::Instant::now();
        queued.close()?;

        // Delivering all 40 would take two seconds.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(log.lock().unwrap().closed);
        Ok(())
    }

    #[test]
    fn relay_failures_are_swallowed_by_the_queue() -> Result<()> {
        let (inner, log) = recorder(true, Duration::ZERO);
        let mut queued = QueuedDispatcher::spawn(inner, 8)?;
        queued.send_alert(&AlertEvent::zone_entry(TrackId(1)))?;
        queued.send_alert(&AlertEvent::zone_entry(TrackId(2)))?;
        drop(queued);
        assert!(log.lock().unwrap().alerts.is_empty());
        Ok(())
    }

    #[test]
    fn fanout_reaches_healthy_targets_when_one_fails() {
        let (good, good_log) = recorder(false, Duration::ZERO);
        let (bad, _) = recorder(true, Duration::ZERO);
        let mut fanout = FanoutDispatcher::new(vec![bad, good]);
        let result = fanout.send_alert(&AlertEvent::zone_entry(TrackId(9)));
        assert!(result.is_err());
        assert_eq!(good_log.lock().unwrap().alerts, vec![TrackId(9)]);
    }
}
