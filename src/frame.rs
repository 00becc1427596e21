//! Frames and the latest-frame slot.
//!
//! - `Frame`: owned RGB24 pixel buffer with dimensions and capture instant.
//! - `FrameSlot`: single-writer, copy-on-read cell holding the most recent frame.
//!
//! The slot is the only state shared between the capture producer and the
//! consumer. Its lock is held for the swap or the copy, never across I/O.

use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, RgbImage};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Immutable snapshot of decoded pixel data (RGB24, row-major, no padding).
///
/// `Clone` produces a private deep copy; readers never alias the producer's buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at: Instant,
    /// Producer-assigned sequence number (0 until published by a source).
    pub sequence: u64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: Instant::now(),
            sequence: 0,
        })
    }

    /// Solid-colour frame; used by synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take((width as usize) * (height as usize) * 3)
            .collect();
        Self::new(pixels, width, height)
    }

    pub fn from_rgb_image(image: RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn into_rgb_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Resize to the target resolution if the native resolution differs.
    ///
    /// The capture instant is preserved.
    pub fn resized(self, width: u32, height: u32) -> Result<Self> {
        if self.width == width && self.height == height {
            return Ok(self);
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("resize target must be non-zero"));
        }
        let captured_at = self.captured_at;
        let sequence = self.sequence;
        let image = RgbImage::from_raw(self.width, self.height, self.pixels)
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let scaled = imageops::resize(&image, width, height, FilterType::Triangle);
        let mut frame = Self::from_rgb_image(scaled)?;
        frame.captured_at = captured_at;
        frame.sequence = sequence;
        Ok(frame)
    }
}

// ----------------------------------------------------------------------------
// FrameSlot
// ----------------------------------------------------------------------------

/// Latest-frame cell shared between one producer and its readers.
///
/// `store` swaps the new frame in; the previous frame is dropped after the
/// lock is released. `snapshot` copies under the lock. A reader can never see
/// a partially written frame.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Returns the previous frame's sequence, if any.
    pub fn store(&self, frame: Frame) -> Option<u64> {
        let previous = {
            let mut guard = self
                .latest
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.replace(frame)
        };
        previous.map(|f| f.sequence)
    }

    /// Private copy of the latest frame.
    pub fn snapshot(&self) -> Option<Frame> {
        let guard = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    /// Capture instant of the latest frame without copying pixels.
    pub fn latest_captured_at(&self) -> Option<Instant> {
        let guard = self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.as_ref().map(Frame::captured_at)
    }

    pub fn clear(&self) {
        let previous = {
            let mut guard = self
                .latest
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        drop(previous);
    }

    pub fn is_empty(&self) -> bool {
        self.latest_captured_at().is_none()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
