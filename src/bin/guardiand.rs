//! guardiand - unsupervised-child danger zone monitor.
//!
//! This daemon:
//! 1. Opens the configured video source behind a reconnecting `FrameSource`
//! 2. Samples person tracking every few frames and classifies adults/children
//! 3. Decides SAFE / WARNING / DANGER for the danger zone at the frame edge
//! 4. Relays status on change or heartbeat, and alerts on zone entry
//!
//! Configuration comes from `GUARDIAN_CONFIG` (JSON or TOML) and `GUARDIAN_*`
//! env vars; flags below override both.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guardian_kernel::config::{parse_resolution, DispatchKind, GuardianConfig};
use guardian_kernel::dataset::DatasetLogger;
use guardian_kernel::transport::{MqttDispatcher, RealtimeDbDispatcher};
use guardian_kernel::ui::{Ui, UiMode};
use guardian_kernel::{
    AlertDispatcher, FanoutDispatcher, FrameSource, Guardian, HeightRatioClassifier,
    LogDispatcher, LogisticRoleClassifier, NullTracker, PersonTracker, QueuedDispatcher,
    RoleClassifier, ScriptedTracker, SessionEnd, SupervisionEngine,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Watch a camera for children entering the danger zone without an attentive adult"
)]
struct Args {
    /// Video source: device index, stub://name, http(s):// MJPEG, rtsp:// or a file path.
    #[arg(long)]
    source: Option<String>,

    /// Capture resolution as WIDTHxHEIGHT.
    #[arg(long)]
    resolution: Option<String>,

    /// Decision loop frames per second.
    #[arg(long)]
    target_fps: Option<u32>,

    /// Run person tracking on every Nth frame.
    #[arg(long)]
    skip_frames: Option<u32>,

    /// Minimum tracker confidence for a person to count.
    #[arg(long, env = "GUARDIAN_CONFIDENCE")]
    confidence: Option<f32>,

    /// Append per-person body features to this CSV file.
    #[arg(long, value_name = "PATH")]
    log_dataset: Option<PathBuf>,

    /// Where status and alerts go (log|realtime-db|mqtt).
    #[arg(long)]
    dispatch: Option<String>,

    /// Logistic classifier weights (JSON). Without them a height threshold is used.
    #[arg(long, env = "GUARDIAN_CLASSIFIER_WEIGHTS")]
    classifier_weights: Option<PathBuf>,

    /// Scripted scene replayed in place of a live person tracker.
    #[arg(long, env = "GUARDIAN_SCENE")]
    scene: Option<PathBuf>,

    /// Seconds to wait for the source to deliver its first frame.
    #[arg(long, env = "GUARDIAN_WARMUP_SECS")]
    warmup_secs: Option<f64>,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(UiMode::parse(&args.ui), std::io::stderr().is_terminal());

    let cfg = {
        let _step = ui.step("Load configuration");
        let mut cfg = GuardianConfig::load()?;
        apply_args(&mut cfg, &args)?;
        cfg.validate()?;
        cfg
    };
    log::info!(
        "guardiand {}: source={} {}x{} target_fps={} detect_every={} dispatch={:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.source,
        cfg.capture.width,
        cfg.capture.height,
        cfg.session.target_fps,
        cfg.session.detect_every,
        cfg.dispatch.kind
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Release);
        })
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;
    }

    let tracker = {
        let _step = ui.step("Load person tracker");
        build_tracker(&cfg)?
    };
    let classifier = {
        let _step = ui.step("Load role classifier");
        build_classifier(&cfg)?
    };
    let dispatcher = {
        let _step = ui.step("Connect dispatcher");
        build_dispatcher(&cfg)?
    };

    let mut guardian = Guardian::new(
        cfg.session.clone(),
        tracker,
        classifier,
        SupervisionEngine::new(cfg.supervision.clone()),
        dispatcher,
    );
    if let Some(path) = cfg.dataset_path.as_deref() {
        guardian = guardian.with_dataset(DatasetLogger::open(path)?);
    }

    let mut source = {
        let _step = ui.step("Start video source");
        FrameSource::start(&cfg.source_spec()?, cfg.capture.clone())?
    };

    let summary = guardian.run(&mut source, &stop)?;
    log::info!(
        "guardiand: {} frames ({} reused), {} detections ({} failed), {} alerts ({} suppressed), {} status pushes",
        summary.frames_processed,
        summary.frames_reused,
        summary.detections_run,
        summary.detector_failures,
        summary.alerts_dispatched,
        summary.alerts_suppressed,
        summary.status_pushes
    );

    match summary.end {
        SessionEnd::Stopped => Ok(()),
        SessionEnd::StreamLost => Err(anyhow!("video source {} was lost", cfg.source)),
    }
}

fn apply_args(cfg: &mut GuardianConfig, args: &Args) -> Result<()> {
    if let Some(source) = &args.source {
        cfg.source = source.clone();
    }
    if let Some(resolution) = &args.resolution {
        let (width, height) = parse_resolution(resolution)?;
        cfg.capture.width = width;
        cfg.capture.height = height;
    }
    if let Some(fps) = args.target_fps {
        cfg.session.target_fps = fps;
    }
    if let Some(skip) = args.skip_frames {
        cfg.session.detect_every = skip;
    }
    if let Some(confidence) = args.confidence {
        cfg.detect.confidence = confidence;
    }
    if let Some(path) = &args.log_dataset {
        cfg.dataset_path = Some(path.clone());
    }
    if let Some(kind) = &args.dispatch {
        cfg.dispatch.kind = kind.parse()?;
    }
    if let Some(path) = &args.classifier_weights {
        cfg.detect.classifier_weights = Some(path.clone());
    }
    if let Some(path) = &args.scene {
        cfg.detect.scene_path = Some(path.clone());
    }
    if let Some(secs) = args.warmup_secs {
        cfg.session.warmup = Duration::try_from_secs_f64(secs)
            .map_err(|_| anyhow!("--warmup-secs must be a non-negative number"))?;
    }
    Ok(())
}

fn build_tracker(cfg: &GuardianConfig) -> Result<Box<dyn PersonTracker>> {
    match cfg.detect.scene_path.as_deref() {
        Some(path) => {
            let mut tracker = ScriptedTracker::from_file(path, cfg.detect.confidence)?;
            tracker.warm_up()?;
            Ok(Box::new(tracker))
        }
        None => {
            log::warn!("guardiand: no person tracker configured, every frame will read as empty");
            Ok(Box::new(NullTracker))
        }
    }
}

fn build_classifier(cfg: &GuardianConfig) -> Result<Box<dyn RoleClassifier>> {
    match cfg.detect.classifier_weights.as_deref() {
        Some(path) => Ok(Box::new(LogisticRoleClassifier::from_file(path)?)),
        None => {
            log::info!(
                "guardiand: no classifier weights, using height threshold {}px",
                cfg.detect.adult_min_height
            );
            Ok(Box::new(HeightRatioClassifier {
                adult_min_height: cfg.detect.adult_min_height,
            }))
        }
    }
}

/// Remote relays are queued behind a worker; the log line stays inline.
fn build_dispatcher(cfg: &GuardianConfig) -> Result<Box<dyn AlertDispatcher>> {
    let remote: Box<dyn AlertDispatcher> = match cfg.dispatch.kind {
        DispatchKind::Log => return Ok(Box::new(LogDispatcher)),
        DispatchKind::RealtimeDb => {
            Box::new(RealtimeDbDispatcher::new(cfg.dispatch.realtime_db.clone())?)
        }
        DispatchKind::Mqtt => Box::new(MqttDispatcher::connect(&cfg.dispatch.mqtt)?),
    };
    let queued = QueuedDispatcher::spawn(remote, cfg.dispatch.queue_depth)?;
    Ok(Box::new(FanoutDispatcher::new(vec![
        Box::new(LogDispatcher),
        Box::new(queued),
    ])))
}
