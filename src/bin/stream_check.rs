//! stream_check - probe a video source and report how stable it is.
//!
//! Runs a `FrameSource` for a fixed window, printing its health on an
//! interval, then prints a summary. Exits non-zero if the source never
//! delivered a frame or gave up reconnecting.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use guardian_kernel::config::{parse_resolution, GuardianConfig};
use guardian_kernel::ui::{health_line, Ui, UiMode};
use guardian_kernel::FrameSource;

#[derive(Parser, Debug)]
#[command(author, version, about = "Check that a video source keeps delivering frames")]
struct Args {
    /// Video source (defaults to the configured one).
    #[arg(long)]
    source: Option<String>,

    /// Capture resolution as WIDTHxHEIGHT.
    #[arg(long)]
    resolution: Option<String>,

    /// How long to watch the stream, in seconds.
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Seconds between health reports.
    #[arg(long, default_value_t = 2)]
    interval: u64,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(UiMode::parse(&args.ui), std::io::stderr().is_terminal());

    let mut cfg = GuardianConfig::load()?;
    if let Some(source) = &args.source {
        cfg.source = source.clone();
    }
    if let Some(resolution) = &args.resolution {
        let (width, height) = parse_resolution(resolution)?;
        cfg.capture.width = width;
        cfg.capture.height = height;
    }
    let spec = cfg.source_spec()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Release);
        })
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;
    }

    let mut source = {
        let _step = ui.step(&format!("Open {}", spec));
        FrameSource::start(&spec, cfg.capture.clone())?
    };

    let window = Duration::from_secs(args.duration.max(1));
    let interval = Duration::from_secs(args.interval.max(1));
    let started = Instant::now();
    let mut next_report = started + interval;
    let mut unhealthy_reports = 0u32;
    let mut reports = 0u32;
    let probe = ui.probe(source.label(), window);

    while started.elapsed() < window && !stop.load(Ordering::Acquire) {
        if source.is_terminated() {
            break;
        }
        if Instant::now() >= next_report {
            let health = source.stream_health();
            reports += 1;
            if !health.is_healthy {
                unhealthy_reports += 1;
            }
            probe.update(&health);
            next_report += interval;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    probe.finish();

    let health = source.stream_health();
    let elapsed = started.elapsed().as_secs_f64();
    let average_fps = if elapsed > 0.0 {
        health.frame_count as f64 / elapsed
    } else {
        0.0
    };
    source.release();

    println!("source:        {}", spec);
    println!("watched:       {:.1}s", elapsed);
    println!("final state:   {}", health_line(&health));
    println!("average fps:   {:.1}", average_fps);
    println!("unhealthy:     {}/{} reports", unhealthy_reports, reports);

    if health.terminated {
        return Err(anyhow!("source {} gave up reconnecting", spec));
    }
    if health.frame_count == 0 {
        return Err(anyhow!("source {} never delivered a frame", spec));
    }
    Ok(())
}
