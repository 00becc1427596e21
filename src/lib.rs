//! SafeEdge Guardian kernel
//!
//! This crate implements the core of a live child-supervision monitor.
//!
//! # Architecture
//!
//! Two subsystems carry the real invariants:
//!
//! 1. **Resilient capture** (`ingest::source`): a background producer owns the
//!    capture handle, survives stalls and disconnects, and publishes only the
//!    latest frame through a single-writer slot. Reads never block.
//! 2. **Supervision decisions** (`supervision`): tracked detections are turned
//!    into a per-frame `SafetyStatus` plus rate-limited danger zone entry alerts.
//!
//! Everything else is a collaborator behind a narrow contract: the person
//! tracker and role classifier (`detect`), the remote relays (`transport`),
//! and the optional feature log (`dataset`). `pipeline` wires them together.
//!
//! # Module Structure
//!
//! - `frame`: owned frames and the latest-frame slot
//! - `ingest`: capture backends and `FrameSource`
//! - `zone`: danger zone geometry
//! - `supervision`: subject bookkeeping and the decision engine
//! - `dispatch`: status relay cadence and fire-and-forget delivery
//! - `pipeline`: the orchestration loop
//! - `config`: file + env configuration for the binaries
//! - `ui`: stderr progress for the binaries
//! - Core types: `TrackId`, `Role`, `Point`, `Detection`, `SafetyStatus`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod dataset;
pub mod detect;
pub mod dispatch;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod supervision;
pub mod transport;
pub mod ui;
pub mod zone;

pub use detect::{
    BodyFeatures, BoundingBox, HeightRatioClassifier, LogisticRoleClassifier, NullTracker,
    PersonTracker, RoleClassifier, ScriptedTracker, TrackedPerson,
};
pub use dispatch::{
    AlertDispatcher, AlertEvent, FanoutDispatcher, LogDispatcher, QueuedDispatcher, StatusRelay,
    StatusUpdate,
};
pub use frame::{Frame, FrameSlot};
pub use ingest::source::{FrameSource, FrameSourceConfig, StreamHealth};
pub use ingest::{CaptureBackend, SourceSpec};
pub use pipeline::{Guardian, SessionConfig, SessionEnd, SessionState, SessionSummary};
pub use supervision::{Assessment, SubjectTable, SupervisionConfig, SupervisionEngine};
pub use zone::DangerZone;

// -------------------- Subjects --------------------

/// Identifier assigned by the external tracker.
///
/// Stable across frames for one physical subject while tracking holds. IDs are
/// recycled by the tracker only within a session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Adult,
    Child,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Adult => "ADULT",
            Role::Child => "CHILD",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(self, other: Point) -> f32 {
        self.distance_squared(other).sqrt()
    }
}

/// One classified, tracked subject on one processed frame. Never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub id: TrackId,
    pub role: Role,
    pub position: Point,
    pub confidence: f32,
}

// -------------------- Status --------------------

/// Aggregated safety status for one evaluated frame.
///
/// Variant order is severity order: `Safe < Warning < Danger`.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum SafetyStatus {
    #[default]
    Safe,
    Warning,
    Danger,
}

impl SafetyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyStatus::Safe => "safe",
            SafetyStatus::Warning => "warning",
            SafetyStatus::Danger => "danger",
        }
    }
}

impl fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-frame subject counts attached to every status push.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub children: usize,
    pub adults: usize,
    pub children_in_zone: usize,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    DangerZoneEntry,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::DangerZoneEntry => "danger_zone_entry",
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch, as relayed to dashboards.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
