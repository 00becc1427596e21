//! Supervision decisions.
//!
//! Turns one frame's classified detections into:
//! - a per-child verdict and the aggregated `SafetyStatus` for the frame
//! - danger zone crossing alerts, rate limited per child
//!
//! `SubjectTable` is the only memory carried between frames: last position,
//! last zone membership, last alert time and last motion sample per tracking
//! ID. It belongs to exactly one session and is mutated only by
//! `SupervisionEngine::evaluate`, sequentially.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::zone::DangerZone;
use crate::{Detection, Point, Role, SafetyStatus, StatusCounts, TrackId};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SupervisionConfig {
    /// An adult closer than this (pixels) to a child can supervise it.
    pub proximity: f32,
    /// An adult must have moved more than this (pixels per evaluated frame).
    pub min_motion: f32,
    /// Minimum spacing between two alerts for the same child.
    pub alert_cooldown: Duration,
    /// Subjects unseen for longer than this are evicted.
    pub eviction_after: Duration,
    /// Hard cap on tracked subjects; the least recently seen entry goes first.
    pub max_subjects: usize,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            proximity: 120.0,
            min_motion: 3.0,
            alert_cooldown: Duration::from_secs(3),
            eviction_after: Duration::from_secs(60),
            max_subjects: 512,
        }
    }
}

// ----------------------------------------------------------------------------
// Subject bookkeeping
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct SubjectState {
    pub role: Role,
    pub last_position: Point,
    pub last_seen: Instant,
    /// Zone membership on the last evaluated frame this subject appeared in.
    pub in_zone: bool,
    pub last_alert: Option<Instant>,
    /// Displacement between the last two evaluated sightings (0 on first sighting).
    pub last_motion: f32,
}

/// Bounded per-tracking-ID state.
#[derive(Debug)]
pub struct SubjectTable {
    subjects: HashMap<TrackId, SubjectState>,
    capacity: usize,
}

impl SubjectTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            subjects: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, id: TrackId) -> Option<&SubjectState> {
        self.subjects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn clear(&mut self) {
        self.subjects.clear();
    }

    /// Record a sighting and return the subject's motion since its previous sighting.
    pub fn observe(&mut self, id: TrackId, role: Role, position: Point, now: Instant) -> f32 {
        if let Some(state) = self.subjects.get_mut(&id) {
            let motion = state.last_position.distance(position);
            state.role = role;
            state.last_position = position;
            state.last_seen = now;
            state.last_motion = motion;
            return motion;
        }

        if self.subjects.len() >= self.capacity {
            self.evict_oldest();
        }
        self.subjects.insert(
            id,
            SubjectState {
                role,
                last_position: position,
                last_seen: now,
                in_zone: false,
                last_alert: None,
                last_motion: 0.0,
            },
        );
        0.0
    }

    /// Store the current zone membership and return the previous one.
    ///
    /// Unknown IDs count as previously outside the zone.
    pub fn update_membership(&mut self, id: TrackId, in_zone: bool) -> bool {
        match self.subjects.get_mut(&id) {
            Some(state) => std::mem::replace(&mut state.in_zone, in_zone),
            None => false,
        }
    }

    /// Claim an alert slot for `id`. True if the cooldown allows an alert now.
    pub fn try_claim_alert(&mut self, id: TrackId, now: Instant, cooldown: Duration) -> bool {
        let Some(state) = self.subjects.get_mut(&id) else {
            return false;
        };
        let allowed = match state.last_alert {
            None => true,
            Some(last) => now.saturating_duration_since(last) > cooldown,
        };
        if allowed {
            state.last_alert = Some(now);
        }
        allowed
    }

    /// Drop subjects unseen for longer than `max_age`. Returns how many were removed.
    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.subjects.len();
        self.subjects
            .retain(|_, state| now.saturating_duration_since(state.last_seen) <= max_age);
        let removed = before - self.subjects.len();
        if removed > 0 {
            log::debug!("SubjectTable: evicted {} stale subjects", removed);
        }
        removed
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .subjects
            .iter()
            .min_by_key(|(_, state)| state.last_seen)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            log::debug!("SubjectTable: at capacity, evicting subject {}", id);
            self.subjects.remove(&id);
        }
    }
}

// ----------------------------------------------------------------------------
// Assessment
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NearestAdult {
    pub id: TrackId,
    pub distance: f32,
    pub motion: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChildVerdict {
    pub id: TrackId,
    pub position: Point,
    pub in_zone: bool,
    pub status: SafetyStatus,
    /// Only looked up for children inside the zone.
    pub nearest_adult: Option<NearestAdult>,
}

/// A child that entered the zone and passed the cooldown.
#[derive(Clone, Debug, PartialEq)]
pub struct CrossingAlert {
    pub child: TrackId,
    pub position: Point,
    pub at: Instant,
}

/// Outcome of evaluating one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assessment {
    pub status: SafetyStatus,
    pub verdicts: Vec<ChildVerdict>,
    pub alerts: Vec<CrossingAlert>,
    /// Crossings swallowed by the cooldown.
    pub suppressed: usize,
    pub counts: StatusCounts,
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Stateless decision rules; all per-subject memory lives in `SubjectTable`.
#[derive(Clone, Debug, Default)]
pub struct SupervisionEngine {
    config: SupervisionConfig,
}

struct AdultSample {
    id: TrackId,
    position: Point,
    motion: f32,
}

impl SupervisionEngine {
    pub fn new(config: SupervisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisionConfig {
        &self.config
    }

    /// Proximity and recent movement. Both comparisons are strict.
    pub fn is_attentive(&self, distance: f32, motion: f32) -> bool {
        distance < self.config.proximity && motion > self.config.min_motion
    }

    /// Evaluate one frame's detections.
    ///
    /// Every subject is observed exactly once (a repeated ID keeps its first
    /// occurrence), so motion is measured between consecutive evaluated frames.
    pub fn evaluate(
        &self,
        subjects: &mut SubjectTable,
        zone: &DangerZone,
        detections: &[Detection],
        now: Instant,
    ) -> Assessment {
        let mut seen = HashSet::new();
        let mut adults = Vec::new();
        let mut children = Vec::new();
        for detection in detections {
            if !seen.insert(detection.id) {
                log::debug!(
                    "SupervisionEngine: duplicate track {} in one frame ignored",
                    detection.id
                );
                continue;
            }
            let motion = subjects.observe(detection.id, detection.role, detection.position, now);
            match detection.role {
                Role::Adult => adults.push(AdultSample {
                    id: detection.id,
                    position: detection.position,
                    motion,
                }),
                Role::Child => children.push((detection.id, detection.position)),
            }
        }

        // Severity pass.
        let mut status = SafetyStatus::Safe;
        let mut verdicts = Vec::with_capacity(children.len());
        for &(id, position) in &children {
            let verdict = self.judge_child(zone, &adults, id, position);
            status = status.max(verdict.status);
            verdicts.push(verdict);
        }

        // Crossing pass, over every child regardless of severity.
        let mut alerts = Vec::new();
        let mut suppressed = 0;
        for verdict in &verdicts {
            let was_in_zone = subjects.update_membership(verdict.id, verdict.in_zone);
            if !verdict.in_zone || was_in_zone {
                continue;
            }
            if subjects.try_claim_alert(verdict.id, now, self.config.alert_cooldown) {
                alerts.push(CrossingAlert {
                    child: verdict.id,
                    position: verdict.position,
                    at: now,
                });
            } else {
                log::debug!(
                    "SupervisionEngine: crossing by child {} within cooldown",
                    verdict.id
                );
                suppressed += 1;
            }
        }

        let counts = StatusCounts {
            children: children.len(),
            adults: adults.len(),
            children_in_zone: verdicts.iter().filter(|v| v.in_zone).count(),
        };

        Assessment {
            status,
            verdicts,
            alerts,
            suppressed,
            counts,
        }
    }

    fn judge_child(
        &self,
        zone: &DangerZone,
        adults: &[AdultSample],
        id: TrackId,
        position: Point,
    ) -> ChildVerdict {
        if !zone.contains(position) {
            return ChildVerdict {
                id,
                position,
                in_zone: false,
                status: SafetyStatus::Safe,
                nearest_adult: None,
            };
        }

        let mut nearest: Option<(&AdultSample, f32)> = None;
        for adult in adults {
            let d2 = adult.position.distance_squared(position);
            match nearest {
                Some((_, best)) if d2 >= best => {}
                _ => nearest = Some((adult, d2)),
            }
        }

        let (status, nearest_adult) = match nearest {
            None => (SafetyStatus::Danger, None),
            Some((adult, d2)) => {
                let distance = d2.sqrt();
                let status = if self.is_attentive(distance, adult.motion) {
                    SafetyStatus::Safe
                } else {
                    SafetyStatus::Warning
                };
                (
                    status,
                    Some(NearestAdult {
                        id: adult.id,
                        distance,
                        motion: adult.motion,
                    }),
                )
            }
        };

        ChildVerdict {
            id,
            position,
            in_zone: true,
            status,
            nearest_adult,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
