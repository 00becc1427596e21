//! Scripted person tracker.
//!
//! Replays a JSON scene instead of running a model, for demos against
//! synthetic sources and for end-to-end tests:
//!
//! ```json
//! {
//!   "loop": true,
//!   "frames": [
//!     [ {"id": 1, "bbox": [380, 40, 420, 160]},
//!       {"id": 2, "bbox": [250, 0, 330, 330], "confidence": 0.8} ],
//!     null
//!   ]
//! }
//! ```
//!
//! Each entry answers one `track` call. `null` is a scripted tracker
//! failure. People without explicit `keypoints` get a standing skeleton
//! scaled to their box.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use super::tracker::{BoundingBox, PersonTracker, TrackedPerson};
use crate::frame::Frame;
use crate::Point;

#[derive(Debug, Deserialize)]
struct Scene {
    #[serde(default, rename = "loop")]
    looped: bool,
    frames: Vec<Option<Vec<ScenePerson>>>,
}

#[derive(Debug, Deserialize)]
struct ScenePerson {
    id: Option<u64>,
    bbox: [f32; 4],
    keypoints: Option<Vec<[f32; 2]>>,
    #[serde(default = "full_confidence")]
    confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

pub struct ScriptedTracker {
    frames: Vec<Option<Vec<TrackedPerson>>>,
    looped: bool,
    min_confidence: f32,
    cursor: usize,
}

impl ScriptedTracker {
    pub fn from_json(json: &str, min_confidence: f32) -> Result<Self> {
        let scene: Scene = serde_json::from_str(json).context("parse scripted scene")?;
        if scene.frames.is_empty() {
            return Err(anyhow!("scripted scene has no frames"));
        }
        let frames = scene
            .frames
            .into_iter()
            .map(|entry| entry.map(|people| people.into_iter().map(into_tracked).collect()))
            .collect();
        Ok(Self {
            frames,
            looped: scene.looped,
            min_confidence,
            cursor: 0,
        })
    }

    pub fn from_file(path: &Path, min_confidence: f32) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read scripted scene {}", path.display()))?;
        let tracker = Self::from_json(&json, min_confidence)
            .with_context(|| format!("load scripted scene {}", path.display()))?;
        log::info!(
            "ScriptedTracker: loaded {} frames from {}",
            tracker.frames.len(),
            path.display()
        );
        Ok(tracker)
    }

    /// Calls answered so far.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

impl PersonTracker for ScriptedTracker {
    fn name(&self) -> &str {
        "scripted"
    }

    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedPerson>> {
        let index = if self.looped {
            self.cursor % self.frames.len()
        } else {
            self.cursor
        };
        self.cursor += 1;

        match self.frames.get(index) {
            Some(Some(people)) => Ok(people
                .iter()
                .filter(|p| p.confidence >= self.min_confidence)
                .cloned()
                .collect()),
            Some(None) => Err(anyhow!("scripted tracker failure at step {}", index)),
            None => Ok(Vec::new()),
        }
    }
}

fn into_tracked(person: ScenePerson) -> TrackedPerson {
    let [x1, y1, x2, y2] = person.bbox;
    let bbox = BoundingBox::new(x1, y1, x2, y2);
    let keypoints = match person.keypoints {
        Some(points) => points.into_iter().map(|[x, y]| Point::new(x, y)).collect(),
        None => standing_skeleton(&bbox),
    };
    TrackedPerson {
        id: person.id,
        bbox,
        keypoints,
        confidence: person.confidence,
    }
}

/// 17 COCO keypoints for an upright person filling `bbox`.
fn standing_skeleton(bbox: &BoundingBox) -> Vec<Point> {
    let cx = (bbox.x1 + bbox.x2) / 2.0;
    let w = bbox.width();
    let h = bbox.height();
    let at = |dx: f32, dy: f32| Point::new(cx + dx * w, bbox.y1 + dy * h);
    vec![
        at(0.0, 0.05),   // nose
        at(-0.05, 0.04), // eyes
        at(0.05, 0.04),
        at(-0.1, 0.05), // ears
        at(0.1, 0.05),
        at(-0.25, 0.2), // shoulders
        at(0.25, 0.2),
        at(-0.3, 0.35), // elbows
        at(0.3, 0.35),
        at(-0.3, 0.5), // wrists
        at(0.3, 0.5),
        at(-0.15, 0.55), // hips
        at(0.15, 0.55),
        at(-0.15, 0.75), // knees
        at(0.15, 0.75),
        at(-0.15, 0.95), // ankles
        at(0.15, 0.95),
    ]
}
