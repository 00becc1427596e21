//! Terminal feedback for the binaries.
//!
//! Startup steps render as spinners on a TTY and as `==>` lines otherwise.
//! `stream_check` also gets a timed bar that carries the latest health line.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::ingest::StreamHealth;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `stderr_is_tty` decides `Auto`; `Pretty` still needs a terminal to draw on.
    pub fn new(mode: UiMode, stderr_is_tty: bool) -> Self {
        let pretty = stderr_is_tty && mode != UiMode::Plain;
        Self { pretty }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    pub fn step(&self, name: &str) -> Step {
        let spinner = if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner.set_message(format!("{name}..."));
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        Step {
            name: name.to_string(),
            started: Instant::now(),
            spinner,
            failed: false,
        }
    }

    /// Bar that fills over `window` while a stream is being probed.
    pub fn probe(&self, label: &str, window: Duration) -> ProbeBar {
        let bar = self.pretty.then(|| {
            let bar = ProgressBar::new(window.as_millis().max(1) as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template("{prefix} [{bar:30}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar.set_prefix(label.to_string());
            bar
        });
        ProbeBar {
            bar,
            started: Instant::now(),
        }
    }
}

/// Reports completion (or failure) of a startup step when dropped.
pub struct Step {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl Step {
    pub fn fail(mut self) {
        self.failed = true;
    }
}

impl Drop for Step {
    fn drop(&mut self) {
        let mark = if self.failed { "x" } else { "ok" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_elapsed(self.started.elapsed())
        );
        match &self.spinner {
            Some(spinner) if self.failed => spinner.abandon_with_message(message),
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub struct ProbeBar {
    bar: Option<ProgressBar>,
    started: Instant,
}

impl ProbeBar {
    pub fn update(&self, health: &StreamHealth) {
        let line = health_line(health);
        match &self.bar {
            Some(bar) => {
                bar.set_position(self.started.elapsed().as_millis() as u64);
                bar.set_message(line);
            }
            None => eprintln!("    {}", line),
        }
    }

    pub fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

pub fn health_line(health: &StreamHealth) -> String {
    let state = if health.terminated {
        "terminated"
    } else if health.is_healthy {
        "healthy"
    } else {
        "unhealthy"
    };
    format!(
        "{} frames={} last={:.1}s reconnects={} (attempt {})",
        state,
        health.frame_count,
        health.seconds_since_last_frame,
        health.total_reconnects,
        health.reconnect_attempts
    )
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(healthy: bool, terminated: bool) -> StreamHealth {
        StreamHealth {
            is_healthy: healthy,
            seconds_since_last_frame: 0.5,
            frame_count: 42,
            reconnect_attempts: 1,
            total_reconnects: 3,
            is_running: !terminated,
            terminated,
        }
    }

    #[test]
    fn plain_mode_never_draws() {
        assert!(!Ui::new(UiMode::Plain, true).is_pretty());
        assert!(!Ui::new(UiMode::Pretty, false).is_pretty());
        assert!(Ui::new(UiMode::parse("auto"), true).is_pretty());
    }

    #[test]
    fn health_line_names_state() {
        assert_eq!(
            health_line(&health(true, false)),
            "healthy frames=42 last=0.5s reconnects=3 (attempt 1)"
        );
        assert!(health_line(&health(false, true)).starts_with("terminated"));
        assert!(health_line(&health(false, false)).starts_with("unhealthy"));
    }
}
