//! Danger zone geometry.
//!
//! The zone is the right-most quarter of the frame at full height. It is a
//! pure function of the frame dimensions and is recomputed only when those
//! dimensions change.

use serde::{Deserialize, Serialize};

use crate::Point;

/// Fraction of the frame width where the zone begins.
pub const ZONE_START_FRACTION: f32 = 0.75;

/// Axis-aligned rectangle in frame pixel coordinates, inclusive on all edges.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DangerZone {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl DangerZone {
    pub fn for_frame(width: u32, height: u32) -> Self {
        Self {
            x1: (width as f32 * ZONE_START_FRACTION).floor(),
            y1: 0.0,
            x2: width as f32,
            y2: height as f32,
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x1 && point.x <= self.x2 && point.y >= self.y1 && point.y <= self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}
