use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::Point;

/// Axis-aligned person box in frame pixels.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Centre in whole pixels: corners truncated, then the midpoint truncated.
    pub fn pixel_center(&self) -> Point {
        let (x1, y1) = (self.x1.trunc(), self.y1.trunc());
        let (x2, y2) = (self.x2.trunc(), self.y2.trunc());
        Point::new(((x1 + x2) / 2.0).trunc(), ((y1 + y2) / 2.0).trunc())
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// One person reported by the tracker for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedPerson {
    /// Absent while the tracker has not (re)acquired the subject.
    pub id: Option<u64>,
    pub bbox: BoundingBox,
    /// Pose keypoints in COCO order (nose, eyes, ears, shoulders, ...).
    pub keypoints: Vec<Point>,
    pub confidence: f32,
}

/// Person detector with stable tracking IDs.
///
/// Implementations own any model state. A failed call is reported as an
/// error and handled by the caller; it must not poison later calls.
pub trait PersonTracker: Send {
    /// Tracker identifier.
    fn name(&self) -> &str;

    /// Detect and track people on one frame.
    ///
    /// The frame is borrowed for the duration of the call only.
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedPerson>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Result of one tracker invocation as seen by the session loop.
#[derive(Clone, Debug, PartialEq)]
pub enum DetectOutcome {
    Detected(Vec<TrackedPerson>),
    Failed { reason: String },
}

impl DetectOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DetectOutcome::Failed { .. })
    }
}

/// Run the tracker, turning an error into `DetectOutcome::Failed`.
pub fn run_tracker(tracker: &mut dyn PersonTracker, frame: &Frame) -> DetectOutcome {
    match tracker.track(frame) {
        Ok(persons) => DetectOutcome::Detected(persons),
        Err(err) => DetectOutcome::Failed {
            reason: format!("{:#}", err),
        },
    }
}

/// Tracker that never sees anyone.
#[derive(Debug, Default)]
pub struct NullTracker;

impl PersonTracker for NullTracker {
    fn name(&self) -> &str {
        "null"
    }

    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedPerson>> {
        Ok(Vec::new())
    }
}
