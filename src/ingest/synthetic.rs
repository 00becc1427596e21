//! Synthetic capture backend (`stub://`).
//!
//! Produces generated RGB frames at the requested resolution. Optional query
//! parameters simulate an unreliable camera:
//!
//! - `fail_every=N`: every Nth read fails
//! - `stall_after=N`: after N frames every read fails and the handle stays open
//! - `close_after=N`: after N frames the handle reports closed
//!
//! Example: `stub://porch?fail_every=7&stall_after=300`.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{CaptureBackend, CaptureSettings};
use crate::frame::Frame;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Faults {
    fail_every: Option<u64>,
    stall_after: Option<u64>,
    close_after: Option<u64>,
}

impl Faults {
    fn parse(query: &str) -> Self {
        let mut faults = Faults::default();
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.trim().parse::<u64>() else {
                log::warn!("SyntheticBackend: ignoring non-numeric {}={}", key, value);
                continue;
            };
            match key.trim() {
                "fail_every" if value > 0 => faults.fail_every = Some(value),
                "stall_after" => faults.stall_after = Some(value),
                "close_after" => faults.close_after = Some(value),
                other => log::warn!("SyntheticBackend: unknown parameter '{}'", other),
            }
        }
        faults
    }
}

pub struct SyntheticBackend {
    name: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    faults: Faults,
    reads: u64,
    frame_count: u64,
    /// Simulated scene state so consecutive frames differ.
    scene_state: u8,
}

impl SyntheticBackend {
    pub fn new(spec: &str, settings: &CaptureSettings) -> Self {
        let (name, query) = spec.split_once('?').unwrap_or((spec, ""));
        let frame_interval = if settings.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / settings.fps as u64)
        };
        log::info!("SyntheticBackend: opened stub://{}", name);
        Self {
            name: name.to_string(),
            width: settings.width,
            height: settings.height,
            frame_interval,
            faults: Faults::parse(query),
            reads: 0,
            frame_count: 0,
            scene_state: 0,
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let noise: u8 = rand::random();

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8 ^ noise;
        }
        pixels
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn is_opened(&self) -> bool {
        match self.faults.close_after {
            Some(limit) => self.frame_count < limit,
            None => true,
        }
    }

    fn read(&mut self) -> Result<Frame> {
        self.reads += 1;
        if !self.is_opened() {
            return Err(anyhow!("stub://{} is closed", self.name));
        }
        if let Some(limit) = self.faults.stall_after {
            if self.frame_count >= limit {
                std::thread::sleep(self.frame_interval);
                return Err(anyhow!("stub://{} stalled", self.name));
            }
        }
        if let Some(every) = self.faults.fail_every {
            if self.reads % every == 0 {
                return Err(anyhow!("stub://{} dropped a frame", self.name));
            }
        }

        std::thread::sleep(self.frame_interval);
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.width, self.height)
    }
}
