//! Session orchestration.
//!
//! `Guardian` owns the collaborators (tracker, classifier, decision engine,
//! dispatcher, optional dataset log). `SessionState` owns everything that
//! lives for one capture session: danger zone, subject table, carried-forward
//! detections and assessment, status relay cadence and counters.
//!
//! Per loop iteration:
//! 1. Read the latest frame, or reuse the last good one for a bounded number
//!    of iterations.
//! 2. Every `detect_every` frames run the tracker, classify people and
//!    evaluate. Other frames, and frames where the tracker fails, carry the
//!    previous detections and assessment forward.
//! 3. Dispatch accepted crossing alerts and relay status on change or
//!    heartbeat. Delivery failures are logged, never propagated.
//! 4. Sleep out the rest of the frame budget.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::dataset::DatasetLogger;
use crate::detect::{
    extract_features, run_tracker, DetectOutcome, PersonTracker, RoleClassifier, TrackedPerson,
};
use crate::dispatch::{AlertDispatcher, AlertEvent, ErrorLatch, StatusRelay, StatusUpdate};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::supervision::{Assessment, SubjectTable, SupervisionEngine};
use crate::zone::DangerZone;
use crate::{Detection, SafetyStatus, TrackId};

// ----------------------------------------------------------------------------
// Configuration and results
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Loop cadence.
    pub target_fps: u32,
    /// Run the tracker on every Nth frame.
    pub detect_every: u32,
    /// Consecutive iterations without a fresh frame before the stream is declared lost.
    pub frame_reuse_limit: u32,
    /// How long to wait for the source to open.
    pub warmup: Duration,
    /// Push an unchanged status after this many frames.
    pub heartbeat_frames: u32,
    pub health_log_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_fps: 10,
            detect_every: 5,
            frame_reuse_limit: 100,
            warmup: Duration::from_secs(2),
            heartbeat_frames: 30,
            health_log_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The stop flag was raised.
    Stopped,
    /// The source terminated or stopped delivering frames.
    StreamLost,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub frames_processed: u64,
    pub frames_reused: u64,
    pub detections_run: u64,
    pub detector_failures: u64,
    pub alerts_dispatched: u64,
    pub alerts_suppressed: u64,
    pub status_pushes: u64,
    pub final_status: SafetyStatus,
}

/// What happened on one processed frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub status: SafetyStatus,
    /// The tracker produced a fresh result and the engine evaluated it.
    pub evaluated: bool,
    pub detector_failed: bool,
    /// Frame dimensions changed (or first frame): zone and subjects were reset.
    pub new_scope: bool,
    pub alerts: Vec<TrackId>,
    pub status_pushed: bool,
}

// ----------------------------------------------------------------------------
// Session state
// ----------------------------------------------------------------------------

pub struct SessionState {
    dims: Option<(u32, u32)>,
    zone: Option<DangerZone>,
    subjects: SubjectTable,
    last_detections: Vec<Detection>,
    last_assessment: Assessment,
    relay: StatusRelay,
    frames_in_scope: u64,
    frames_processed: u64,
    frames_reused: u64,
    detections_run: u64,
    detector_failures: u64,
    alerts_dispatched: u64,
    alerts_suppressed: u64,
    status_pushes: u64,
}

impl SessionState {
    pub fn new(heartbeat_frames: u32, max_subjects: usize) -> Self {
        Self {
            dims: None,
            zone: None,
            subjects: SubjectTable::new(max_subjects),
            last_detections: Vec::new(),
            last_assessment: Assessment::default(),
            relay: StatusRelay::new(heartbeat_frames),
            frames_in_scope: 0,
            frames_processed: 0,
            frames_reused: 0,
            detections_run: 0,
            detector_failures: 0,
            alerts_dispatched: 0,
            alerts_suppressed: 0,
            status_pushes: 0,
        }
    }

    pub fn zone(&self) -> Option<&DangerZone> {
        self.zone.as_ref()
    }

    pub fn status(&self) -> SafetyStatus {
        self.last_assessment.status
    }

    pub fn last_assessment(&self) -> &Assessment {
        &self.last_assessment
    }

    pub fn last_detections(&self) -> &[Detection] {
        &self.last_detections
    }

    pub fn subjects(&self) -> &SubjectTable {
        &self.subjects
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    fn reset_scope(&mut self, width: u32, height: u32) {
        let zone = DangerZone::for_frame(width, height);
        log::info!(
            "Session: {}x{} frames, danger zone [{}, {}, {}, {}]",
            width,
            height,
            zone.x1,
            zone.y1,
            zone.x2,
            zone.y2
        );
        self.dims = Some((width, height));
        self.zone = Some(zone);
        self.subjects.clear();
        self.last_detections.clear();
        self.last_assessment = Assessment::default();
        self.relay.reset();
        self.frames_in_scope = 0;
    }

    fn summary(&self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            end,
            frames_processed: self.frames_processed,
            frames_reused: self.frames_reused,
            detections_run: self.detections_run,
            detector_failures: self.detector_failures,
            alerts_dispatched: self.alerts_dispatched,
            alerts_suppressed: self.alerts_suppressed,
            status_pushes: self.status_pushes,
            final_status: self.status(),
        }
    }
}

// ----------------------------------------------------------------------------
// Guardian
// ----------------------------------------------------------------------------

pub struct Guardian {
    config: SessionConfig,
    tracker: Box<dyn PersonTracker>,
    classifier: Box<dyn RoleClassifier>,
    engine: SupervisionEngine,
    dispatcher: Box<dyn AlertDispatcher>,
    dataset: Option<DatasetLogger>,
    relay_errors: ErrorLatch,
}

impl Guardian {
    pub fn new(
        config: SessionConfig,
        tracker: Box<dyn PersonTracker>,
        classifier: Box<dyn RoleClassifier>,
        engine: SupervisionEngine,
        dispatcher: Box<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            config,
            tracker,
            classifier,
            engine,
            dispatcher,
            dataset: None,
            relay_errors: ErrorLatch::default(),
        }
    }

    pub fn with_dataset(mut self, dataset: DatasetLogger) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Fresh session scope sized for this guardian.
    pub fn new_session(&self) -> SessionState {
        SessionState::new(
            self.config.heartbeat_frames,
            self.engine.config().max_subjects,
        )
    }

    /// Process one frame: sample detection, evaluate, alert, relay.
    pub fn process_frame(
        &mut self,
        state: &mut SessionState,
        frame: &Frame,
        now: Instant,
    ) -> FrameReport {
        let mut report = FrameReport::default();
        let (width, height) = frame.dimensions();
        if state.dims != Some((width, height)) {
            if state.dims.is_some() {
                log::info!("Session: frame size changed, starting a new scope");
            }
            state.reset_scope(width, height);
            report.new_scope = true;
        }

        let detect_every = u64::from(self.config.detect_every.max(1));
        if state.frames_in_scope % detect_every == 0 {
            state.detections_run += 1;
            match run_tracker(self.tracker.as_mut(), frame) {
                DetectOutcome::Detected(persons) => {
                    let detections = self.classify(&persons);
                    let zone = state
                        .zone
                        .unwrap_or_else(|| DangerZone::for_frame(width, height));
                    let assessment =
                        self.engine
                            .evaluate(&mut state.subjects, &zone, &detections, now);
                    state
                        .subjects
                        .evict_stale(now, self.engine.config().eviction_after);
                    state.last_detections = detections;
                    state.last_assessment = assessment;
                    report.evaluated = true;
                }
                DetectOutcome::Failed { reason } => {
                    state.detector_failures += 1;
                    report.detector_failed = true;
                    log::warn!(
                        "Session: {} tracker failed, keeping previous detections: {}",
                        self.tracker.name(),
                        reason
                    );
                }
            }
        }
        state.frames_in_scope += 1;
        state.frames_processed += 1;

        if report.evaluated {
            state.alerts_suppressed += state.last_assessment.suppressed as u64;
            for alert in &state.last_assessment.alerts {
                log::warn!("Session: child {} entered the danger zone", alert.child);
                let result = self.dispatcher.send_alert(&AlertEvent::zone_entry(alert.child));
                self.relay_errors
                    .record(self.dispatcher.name(), "alert", result);
                state.alerts_dispatched += 1;
                report.alerts.push(alert.child);
            }
        }

        let status = state.last_assessment.status;
        let previous = state.relay.last_relayed();
        if state.relay.observe(status) {
            if previous != Some(status) {
                log::info!("Session: status {}", status);
            }
            let update = StatusUpdate::now(status, state.last_assessment.counts);
            let result = self.dispatcher.update_status(&update);
            self.relay_errors
                .record(self.dispatcher.name(), "status update", result);
            state.status_pushes += 1;
            report.status_pushed = true;
        }

        report.status = status;
        report
    }

    /// Drive a session until `stop` is raised or the stream is lost.
    ///
    /// Fails only when the source never opens within the warm-up window. The
    /// source is released and the dispatcher closed on every other exit.
    pub fn run(&mut self, source: &mut FrameSource, stop: &AtomicBool) -> Result<SessionSummary> {
        if !self.wait_for_source(source, stop) {
            if stop.load(Ordering::Acquire) {
                source.release();
                self.close_dispatcher();
                return Ok(self.new_session().summary(SessionEnd::Stopped));
            }
            return Err(anyhow!(
                "video source {} did not open within {:?}",
                source.label(),
                self.config.warmup
            ));
        }
        log::info!(
            "Session: started on {} (detect every {} frames, {} fps target)",
            source.label(),
            self.config.detect_every,
            self.config.target_fps
        );

        let frame_budget = Duration::from_secs_f64(1.0 / f64::from(self.config.target_fps.max(1)));
        let mut state = self.new_session();
        let mut last_good: Option<Frame> = None;
        let mut misses = 0u32;
        let mut last_health_log = Instant::now();

        let end = loop {
            let iteration_start = Instant::now();
            if stop.load(Ordering::Acquire) {
                break SessionEnd::Stopped;
            }
            if source.is_terminated() {
                log::error!("Session: video source {} gave up reconnecting", source.label());
                break SessionEnd::StreamLost;
            }

            match source.read() {
                Some(frame) => {
                    misses = 0;
                    last_good = Some(frame);
                }
                None => {
                    misses += 1;
                    if misses >= self.config.frame_reuse_limit {
                        log::error!(
                            "Session: no fresh frame for {} iterations, stream lost",
                            misses
                        );
                        break SessionEnd::StreamLost;
                    }
                    if last_good.is_some() {
                        state.frames_reused += 1;
                    }
                }
            }

            if let Some(frame) = last_good.as_ref() {
                self.process_frame(&mut state, frame, Instant::now());
            }

            if last_health_log.elapsed() >= self.config.health_log_interval {
                let health = source.stream_health();
                log::info!(
                    "Session: stream healthy={} frames={} last_frame={:.1}s reconnects={} status={}",
                    health.is_healthy,
                    health.frame_count,
                    health.seconds_since_last_frame,
                    health.total_reconnects,
                    state.status()
                );
                last_health_log = Instant::now();
            }

            if let Some(rest) = frame_budget.checked_sub(iteration_start.elapsed()) {
                std::thread::sleep(rest);
            }
        };

        source.release();
        self.close_dispatcher();
        let summary = state.summary(end);
        log::info!(
            "Session: ended ({:?}) after {} frames, {} alerts, final status {}",
            summary.end,
            summary.frames_processed,
            summary.alerts_dispatched,
            summary.final_status
        );
        Ok(summary)
    }

    fn wait_for_source(&self, source: &FrameSource, stop: &AtomicBool) -> bool {
        let deadline = Instant::now() + self.config.warmup;
        loop {
            if source.is_opened() && source.read().is_some() {
                return true;
            }
            if stop.load(Ordering::Acquire) || source.is_terminated() || Instant::now() >= deadline
            {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn close_dispatcher(&mut self) {
        if let Err(err) = self.dispatcher.close() {
            log::warn!("Session: closing {} failed: {:#}", self.dispatcher.name(), err);
        }
    }

    /// Classify tracked people into detections, skipping untracked or partial poses.
    fn classify(&mut self, persons: &[TrackedPerson]) -> Vec<Detection> {
        let mut detections = Vec::with_capacity(persons.len());
        for person in persons {
            let Some(id) = person.id else {
                log::debug!("Session: skipping untracked person");
                continue;
            };
            let Some(features) = extract_features(&person.keypoints) else {
                log::debug!(
                    "Session: skipping person {} with {} keypoints",
                    id,
                    person.keypoints.len()
                );
                continue;
            };
            let classification = self.classifier.classify(&features);
            let center = person.bbox.pixel_center();
            let id = TrackId(id);

            if let Some(dataset) = self.dataset.as_mut() {
                if let Err(err) = dataset.log(id, &features, classification.role) {
                    log::warn!("Session: dataset logging disabled: {:#}", err);
                    self.dataset = None;
                }
            }

            detections.push(Detection {
                id,
                role: classification.role,
                position: center,
                confidence: classification.confidence,
            });
        }
        detections
    }
}
