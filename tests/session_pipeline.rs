use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use guardian_kernel::dataset::{DatasetLogger, DATASET_HEADER};
use guardian_kernel::ingest::BackendFactory;
use guardian_kernel::{
    AlertDispatcher, AlertEvent, CaptureBackend, Frame, FrameSource, FrameSourceConfig, Guardian,
    HeightRatioClassifier, SafetyStatus, ScriptedTracker, SessionConfig, SessionEnd, SourceSpec,
    StatusUpdate, SupervisionConfig, SupervisionEngine, TrackId,
};

// Child centred at (400,100), inside the 480x360 zone [360,0,480,360].
const CHILD: &str = r#"{"id": 7, "bbox": [380, 40, 420, 160]}"#;
// Adults 300px tall: centred at (300,150) and (390,150).
const ADULT_FAR: &str = r#"{"id": 1, "bbox": [260, 0, 340, 300]}"#;
const ADULT_NEAR: &str = r#"{"id": 1, "bbox": [350, 0, 430, 300]}"#;
// The same child back at (200,100), outside the zone.
const CHILD_OUTSIDE: &str = r#"{"id": 7, "bbox": [180, 40, 220, 160]}"#;

#[derive(Default)]
struct Journal {
    statuses: Vec<StatusUpdate>,
    alerts: Vec<AlertEvent>,
    closed: bool,
}

struct Recorder {
    journal: Arc<Mutex<Journal>>,
    fail: bool,
}

impl AlertDispatcher for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn update_status(&mut self, update: &StatusUpdate) -> Result<()> {
        self.journal.lock().unwrap().statuses.push(update.clone());
        if self.fail {
            return Err(anyhow!("relay offline"));
        }
        Ok(())
    }

    fn send_alert(&mut self, alert: &AlertEvent) -> Result<()> {
        self.journal.lock().unwrap().alerts.push(alert.clone());
        if self.fail {
            return Err(anyhow!("relay offline"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.journal.lock().unwrap().closed = true;
        Ok(())
    }
}

fn scene(frames: &[&str]) -> String {
    format!(r#"{{"frames": [{}]}}"#, frames.join(","))
}

fn guardian(
    scene_json: &str,
    config: SessionConfig,
    fail: bool,
) -> Result<(Guardian, Arc<Mutex<Journal>>)> {
    let journal = Arc::new(Mutex::new(Journal::default()));
    let guardian = Guardian::new(
        config,
        Box::new(ScriptedTracker::from_json(scene_json, 0.4)?),
        Box::new(HeightRatioClassifier::default()),
        SupervisionEngine::new(SupervisionConfig::default()),
        Box::new(Recorder {
            journal: Arc::clone(&journal),
            fail,
        }),
    );
    Ok((guardian, journal))
}

fn every_frame() -> SessionConfig {
    SessionConfig {
        detect_every: 1,
        ..SessionConfig::default()
    }
}

fn frame(width: u32, height: u32) -> Frame {
    Frame::filled(width, height, [10, 10, 10]).unwrap()
}

#[test]
fn statuses_follow_the_scene_and_failures_carry_forward() -> Result<()> {
    let json = scene(&[
        &format!("[{CHILD}, {ADULT_FAR}]"),
        &format!("[{CHILD}, {ADULT_NEAR}]"),
        &format!("[{CHILD}, {ADULT_NEAR}]"),
        "null",
        "[]",
    ]);
    let (mut guardian, journal) = guardian(&json, every_frame(), false)?;
    let mut state = guardian.new_session();
    let image = frame(480, 360);
    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);

    // Adult close enough but not yet seen moving; first sighting of the child is a crossing.
    let report = guardian.process_frame(&mut state, &image, at(0));
    assert!(report.new_scope);
    assert!(report.evaluated);
    assert_eq!(report.status, SafetyStatus::Warning);
    assert_eq!(report.alerts, vec![TrackId(7)]);
    assert!(report.status_pushed);
    assert_eq!(state.last_detections().len(), 2);

    // Adult walked 90px towards the child.
    let report = guardian.process_frame(&mut state, &image, at(100));
    assert_eq!(report.status, SafetyStatus::Safe);
    assert!(report.alerts.is_empty());
    assert!(report.status_pushed);

    // Same positions again: no motion.
    let report = guardian.process_frame(&mut state, &image, at(200));
    assert_eq!(report.status, SafetyStatus::Warning);

    // Tracker failure keeps the previous picture.
    let report = guardian.process_frame(&mut state, &image, at(300));
    assert!(report.detector_failed);
    assert!(!report.evaluated);
    assert_eq!(report.status, SafetyStatus::Warning);
    assert!(!report.status_pushed);
    assert_eq!(state.last_detections().len(), 2);

    let report = guardian.process_frame(&mut state, &image, at(400));
    assert_eq!(report.status, SafetyStatus::Safe);
    assert_eq!(state.last_assessment().counts.children, 0);

    let journal = journal.lock().unwrap();
    let statuses: Vec<SafetyStatus> = journal.statuses.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            SafetyStatus::Warning,
            SafetyStatus::Safe,
            SafetyStatus::Warning,
            SafetyStatus::Safe
        ]
    );
    assert_eq!(journal.statuses[0].counts.children, 1);
    assert_eq!(journal.statuses[0].counts.adults, 1);
    assert_eq!(journal.statuses[0].counts.children_in_zone, 1);
    assert_eq!(journal.alerts.len(), 1);
    assert_eq!(journal.alerts[0].subject, TrackId(7));
    Ok(())
}

#[test]
fn detection_runs_on_sampled_frames_only() -> Result<()> {
    let json = format!(r#"{{"loop": true, "frames": [[{CHILD}]]}}"#);
    let config = SessionConfig {
        detect_every: 3,
        ..SessionConfig::default()
    };
    let (mut guardian, journal) = guardian(&json, config, false)?;
    let mut state = guardian.new_session();
    let image = frame(480, 360);
    let t0 = Instant::now();

    let evaluated: Vec<bool> = (0..7u64)
        .map(|i| {
            guardian
                .process_frame(&mut state, &image, t0 + Duration::from_millis(i * 100))
                .evaluated
        })
        .collect();
    assert_eq!(evaluated, vec![true, false, false, true, false, false, true]);
    assert_eq!(state.frames_processed(), 7);
    assert_eq!(state.status(), SafetyStatus::Danger);
    // Lingering in the zone is a single crossing.
    assert_eq!(journal.lock().unwrap().alerts.len(), 1);
    Ok(())
}

#[test]
fn heartbeat_repeats_unchanged_status() -> Result<()> {
    let json = r#"{"loop": true, "frames": [[]]}"#;
    let config = SessionConfig {
        detect_every: 1,
        heartbeat_frames: 4,
        ..SessionConfig::default()
    };
    let (mut guardian, journal) = guardian(json, config, false)?;
    let mut state = guardian.new_session();
    let image = frame(480, 360);
    let now = Instant::now();

    let pushed: Vec<bool> = (0..9)
        .map(|_| guardian.process_frame(&mut state, &image, now).status_pushed)
        .collect();
    assert_eq!(
        pushed,
        vec![true, false, false, false, true, false, false, false, true]
    );
    assert_eq!(journal.lock().unwrap().statuses.len(), 3);
    Ok(())
}

#[test]
fn frame_size_change_starts_a_new_scope() -> Result<()> {
    let json = format!(r#"{{"loop": true, "frames": [[{CHILD}]]}}"#);
    let (mut guardian, journal) = guardian(&json, every_frame(), false)?;
    let mut state = guardian.new_session();
    let now = Instant::now();

    let report = guardian.process_frame(&mut state, &frame(480, 360), now);
    assert_eq!(report.status, SafetyStatus::Danger);
    assert_eq!(state.zone().map(|z| z.x1), Some(360.0));

    // At 640 wide the zone starts at x=480 and the child is outside it.
    let report = guardian.process_frame(&mut state, &frame(640, 480), now);
    assert!(report.new_scope);
    assert_eq!(report.status, SafetyStatus::Safe);
    assert_eq!(state.zone().map(|z| z.x1), Some(480.0));
    assert_eq!(state.subjects().len(), 1);

    // Back to 480: the child's earlier membership was forgotten, so it crosses again.
    let report = guardian.process_frame(&mut state, &frame(480, 360), now);
    assert!(report.new_scope);
    assert_eq!(report.alerts, vec![TrackId(7)]);

    // Subjects are cleared with the scope, so the cooldown does not carry over.
    assert_eq!(journal.lock().unwrap().alerts.len(), 2);
    Ok(())
}

#[test]
fn relay_failures_do_not_interrupt_the_session() -> Result<()> {
    let json = format!(r#"{{"loop": true, "frames": [[{CHILD}], [{CHILD_OUTSIDE}]]}}"#);
    let (mut guardian, journal) = guardian(&json, every_frame(), true)?;
    let mut state = guardian.new_session();
    let image = frame(480, 360);
    let t0 = Instant::now();

    for i in 0..6u64 {
        guardian.process_frame(&mut state, &image, t0 + Duration::from_secs(i * 4));
    }
    let journal = journal.lock().unwrap();
    assert_eq!(journal.statuses.len(), 6);
    assert_eq!(journal.alerts.len(), 3);
    Ok(())
}

#[test]
fn dataset_rows_are_logged_per_classified_person() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pose_features.csv");
    let json = scene(&[
        &format!("[{CHILD}, {ADULT_FAR}]"),
        // Too few keypoints to classify.
        r#"[{"id": 9, "bbox": [0, 0, 10, 10], "keypoints": [[1, 1], [2, 2]]}]"#,
    ]);
    let (guardian, _journal) = guardian(&json, every_frame(), false)?;
    let mut guardian = guardian.with_dataset(DatasetLogger::open(&path)?);
    let mut state = guardian.new_session();
    let image = frame(480, 360);
    let now = Instant::now();

    guardian.process_frame(&mut state, &image, now);
    let report = guardian.process_frame(&mut state, &image, now);
    assert!(report.evaluated);
    assert!(state.last_detections().is_empty());

    let contents = std::fs::read_to_string(&path)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], DATASET_HEADER);
    assert!(lines[1].ends_with(",7,60,0.333,CHILD"), "{}", lines[1]);
    assert!(lines[2].ends_with(",1,150,0.267,ADULT"), "{}", lines[2]);
    Ok(())
}

#[test]
fn run_stops_on_flag_and_closes_dispatcher() -> Result<()> {
    let json = format!(r#"{{"loop": true, "frames": [[{CHILD}]]}}"#);
    let config = SessionConfig {
        target_fps: 50,
        detect_every: 2,
        ..SessionConfig::default()
    };
    let (mut guardian, journal) = guardian(&json, config, false)?;
    let mut source = FrameSource::start(
        &SourceSpec::parse("stub://session")?,
        FrameSourceConfig {
            capture_fps: 60,
            ..FrameSourceConfig::default()
        },
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let stopper = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(400));
            stop.store(true, Ordering::Release);
        })
    };
    let summary = guardian.run(&mut source, &stop)?;
    stopper.join().unwrap();

    assert_eq!(summary.end, SessionEnd::Stopped);
    assert!(summary.frames_processed > 0);
    assert!(summary.detections_run > 0);
    assert_eq!(summary.alerts_dispatched, 1);
    assert_eq!(summary.final_status, SafetyStatus::Danger);
    assert!(!source.stream_health().is_running);
    let journal = journal.lock().unwrap();
    assert!(journal.closed);
    assert_eq!(journal.alerts.len(), 1);
    Ok(())
}

/// Three frames, then an open handle that never delivers again. Reopening fails.
struct FadingBackend {
    served: u32,
}

impl CaptureBackend for FadingBackend {
    fn name(&self) -> &'static str {
        "fading"
    }

    fn is_opened(&self) -> bool {
        true
    }

    fn read(&mut self) -> Result<Frame> {
        std::thread::sleep(Duration::from_millis(5));
        if self.served >= 3 {
            return Err(anyhow!("no signal"));
        }
        self.served += 1;
        Frame::filled(480, 360, [0, 0, 0])
    }
}

#[test]
fn run_ends_when_the_stream_goes_quiet() -> Result<()> {
    let config = SessionConfig {
        target_fps: 100,
        frame_reuse_limit: 5,
        ..SessionConfig::default()
    };
    let (mut guardian, journal) = guardian(r#"{"loop": true, "frames": [[]]}"#, config, false)?;
    let opens = Arc::new(AtomicUsize::new(0));
    let factory: BackendFactory = {
        let opens = Arc::clone(&opens);
        Box::new(move || {
            if opens.fetch_add(1, Ordering::SeqCst) == 0 {
                let backend: Box<dyn CaptureBackend> = Box::new(FadingBackend { served: 0 });
                Ok(backend)
            } else {
                Err(anyhow!("camera unplugged"))
            }
        })
    };
    let mut source = FrameSource::start_with_factory(
        "fading",
        false,
        factory,
        FrameSourceConfig {
            stale_after: Duration::from_millis(150),
            reconnect_delay: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(5),
            ..FrameSourceConfig::default()
        },
    )?;

    let stop = AtomicBool::new(false);
    let summary = guardian.run(&mut source, &stop)?;
    assert_eq!(summary.end, SessionEnd::StreamLost);
    assert!(summary.frames_processed > 0);
    assert!(summary.frames_reused > 0);
    assert!(journal.lock().unwrap().closed);
    Ok(())
}

#[test]
fn half_pixel_centre_on_the_zone_edge_stays_outside() -> Result<()> {
    // Centre (359.5, 100) truncates to x = 359, one pixel left of the zone.
    let json = scene(&[r#"[{"id": 7, "bbox": [340, 40, 379, 160]}]"#]);
    let (mut guardian, journal) = guardian(&json, every_frame(), false)?;
    let mut state = guardian.new_session();

    let report = guardian.process_frame(&mut state, &frame(480, 360), Instant::now());
    assert!(report.evaluated);
    assert_eq!(report.status, SafetyStatus::Safe);
    assert!(report.alerts.is_empty());
    assert_eq!(state.last_detections()[0].position.x, 359.0);
    assert_eq!(state.last_assessment().counts.children_in_zone, 0);
    assert!(journal.lock().unwrap().alerts.is_empty());
    Ok(())
}

#[test]
fn run_reuses_the_last_frame_one_less_than_the_limit() -> Result<()> {
    let config = SessionConfig {
        target_fps: 100,
        frame_reuse_limit: 5,
        ..SessionConfig::default()
    };
    let (mut guardian, _journal) = guardian(r#"{"loop": true, "frames": [[]]}"#, config, false)?;
    let opens = Arc::new(AtomicUsize::new(0));
    let factory: BackendFactory = {
        let opens = Arc::clone(&opens);
        Box::new(move || {
            // Reopened handles stay open but never deliver, so the source never terminates.
            let served = if opens.fetch_add(1, Ordering::SeqCst) == 0 { 0 } else { 3 };
            let backend: Box<dyn CaptureBackend> = Box::new(FadingBackend { served });
            Ok(backend)
        })
    };
    let mut source = FrameSource::start_with_factory(
        "fading",
        false,
        factory,
        FrameSourceConfig {
            stale_after: Duration::from_millis(150),
            reconnect_delay: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(5),
            max_reconnect_attempts: 1_000_000,
            ..FrameSourceConfig::default()
        },
    )?;

    let stop = AtomicBool::new(false);
    let summary = guardian.run(&mut source, &stop)?;
    assert_eq!(summary.end, SessionEnd::StreamLost);
    // The fifth miss in a row ends the session instead of reusing again.
    assert_eq!(summary.frames_reused, 4);
    Ok(())
}

#[test]
fn run_fails_when_the_source_never_opens() -> Result<()> {
    let config = SessionConfig {
        warmup: Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let (mut guardian, _journal) = guardian(r#"{"frames": [[]]}"#, config, false)?;
    let mut source = FrameSource::start(
        &SourceSpec::parse("stub://dead?stall_after=0")?,
        FrameSourceConfig {
            reconnect_delay: Duration::from_millis(10),
            ..FrameSourceConfig::default()
        },
    )?;

    let stop = AtomicBool::new(false);
    assert!(guardian.run(&mut source, &stop).is_err());
    Ok(())
}
