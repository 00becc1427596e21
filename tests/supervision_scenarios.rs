use std::time::{Duration, Instant};

use guardian_kernel::{
    DangerZone, Detection, Point, Role, SafetyStatus, SubjectTable, SupervisionConfig,
    SupervisionEngine, TrackId,
};

const CHILD: u64 = 7;
const ADULT: u64 = 1;

fn child(id: u64, x: f32, y: f32) -> Detection {
    Detection {
        id: TrackId(id),
        role: Role::Child,
        position: Point::new(x, y),
        confidence: 0.9,
    }
}

fn adult(id: u64, x: f32, y: f32) -> Detection {
    Detection {
        id: TrackId(id),
        role: Role::Adult,
        position: Point::new(x, y),
        confidence: 0.9,
    }
}

struct Scene {
    engine: SupervisionEngine,
    subjects: SubjectTable,
    zone: DangerZone,
    start: Instant,
}

impl Scene {
    fn new() -> Self {
        let engine = SupervisionEngine::new(SupervisionConfig::default());
        let subjects = SubjectTable::new(engine.config().max_subjects);
        Self {
            engine,
            subjects,
            zone: DangerZone::for_frame(480, 360),
            start: Instant::now(),
        }
    }

    fn status_at(&mut self, millis: u64, detections: &[Detection]) -> SafetyStatus {
        self.alerts_at(millis, detections).0
    }

    fn alerts_at(&mut self, millis: u64, detections: &[Detection]) -> (SafetyStatus, usize) {
        let now = self.start + Duration::from_millis(millis);
        let assessment = self
            .engine
            .evaluate(&mut self.subjects, &self.zone, detections, now);
        (assessment.status, assessment.alerts.len())
    }
}

#[test]
fn zone_covers_the_right_quarter() {
    let zone = DangerZone::for_frame(480, 360);
    assert_eq!((zone.x1, zone.y1, zone.x2, zone.y2), (360.0, 0.0, 480.0, 360.0));
    assert!(zone.contains(Point::new(400.0, 100.0)));
    assert!(zone.contains(Point::new(360.0, 0.0)));
    assert!(zone.contains(Point::new(480.0, 360.0)));
    assert!(!zone.contains(Point::new(359.0, 100.0)));
}

#[test]
fn lone_child_in_zone_is_danger() {
    let mut scene = Scene::new();
    assert_eq!(scene.status_at(0, &[child(CHILD, 400.0, 100.0)]), SafetyStatus::Danger);
}

#[test]
fn moving_adult_nearby_makes_child_safe() {
    let mut scene = Scene::new();
    // First sighting of the adult: no motion yet.
    assert_eq!(
        scene.status_at(0, &[child(CHILD, 400.0, 100.0), adult(ADULT, 300.0, 105.0)]),
        SafetyStatus::Warning
    );
    // Moved 90 pixels and is now about 11 pixels away.
    assert_eq!(
        scene.status_at(500, &[child(CHILD, 400.0, 100.0), adult(ADULT, 390.0, 105.0)]),
        SafetyStatus::Safe
    );
}

#[test]
fn stationary_adult_nearby_is_warning() {
    let mut scene = Scene::new();
    let frame = [child(CHILD, 400.0, 100.0), adult(ADULT, 390.0, 105.0)];
    assert_eq!(scene.status_at(0, &frame), SafetyStatus::Warning);
    assert_eq!(scene.status_at(500, &frame), SafetyStatus::Warning);
}

#[test]
fn static_frame_evaluated_twice_stays_warning() {
    let mut scene = Scene::new();
    let frame = [child(CHILD, 400.0, 100.0), adult(ADULT, 300.0, 105.0)];
    scene.status_at(0, &[child(CHILD, 400.0, 100.0), adult(ADULT, 250.0, 105.0)]);
    // The move to (300,105) makes this frame attentive; repeating it does not.
    assert_eq!(scene.status_at(100, &frame), SafetyStatus::Safe);
    assert_eq!(scene.status_at(200, &frame), SafetyStatus::Warning);
    assert_eq!(scene.status_at(300, &frame), SafetyStatus::Warning);
}

#[test]
fn children_outside_zone_are_safe_regardless_of_adults() {
    let mut scene = Scene::new();
    assert_eq!(scene.status_at(0, &[child(CHILD, 100.0, 100.0)]), SafetyStatus::Safe);
    assert_eq!(
        scene.status_at(100, &[child(CHILD, 359.0, 200.0), adult(ADULT, 20.0, 20.0)]),
        SafetyStatus::Safe
    );
}

#[test]
fn far_adult_does_not_supervise() {
    let mut scene = Scene::new();
    scene.status_at(0, &[adult(ADULT, 100.0, 100.0)]);
    // Moving fast but 300 pixels away.
    assert_eq!(
        scene.status_at(100, &[child(CHILD, 420.0, 100.0), adult(ADULT, 120.0, 100.0)]),
        SafetyStatus::Warning
    );
}

#[test]
fn worst_child_sets_the_frame_status() {
    let mut scene = Scene::new();
    scene.status_at(0, &[adult(ADULT, 300.0, 100.0)]);
    let frame = [
        child(2, 100.0, 100.0),
        child(3, 400.0, 100.0),
        adult(ADULT, 390.0, 100.0),
    ];
    assert_eq!(scene.status_at(100, &frame), SafetyStatus::Safe);

    // A second, unattended child far down the zone: its nearest adult is too far.
    let frame = [
        child(3, 400.0, 100.0),
        child(4, 470.0, 350.0),
        adult(ADULT, 380.0, 100.0),
    ];
    assert_eq!(scene.status_at(200, &frame), SafetyStatus::Warning);
}

#[test]
fn crossings_within_cooldown_alert_once() {
    let mut scene = Scene::new();
    let outside = [child(CHILD, 300.0, 100.0)];
    let inside = [child(CHILD, 400.0, 100.0)];

    assert_eq!(scene.alerts_at(0, &outside).1, 0);
    assert_eq!(scene.alerts_at(100, &inside), (SafetyStatus::Danger, 1));
    // Lingering inside is not a new crossing.
    assert_eq!(scene.alerts_at(200, &inside).1, 0);
    assert_eq!(scene.alerts_at(1_000, &outside).1, 0);
    // Second crossing 1.9s after the alert: suppressed.
    assert_eq!(scene.alerts_at(2_000, &inside), (SafetyStatus::Danger, 0));
    assert_eq!(scene.alerts_at(2_500, &outside).1, 0);
    // Third crossing 3.4s after the alert: dispatched.
    assert_eq!(scene.alerts_at(3_500, &inside).1, 1);
}

#[test]
fn first_sighting_inside_zone_counts_as_crossing() {
    let mut scene = Scene::new();
    assert_eq!(scene.alerts_at(0, &[child(CHILD, 400.0, 100.0)]).1, 1);
}

#[test]
fn crossing_alerts_fire_even_when_supervised() {
    let mut scene = Scene::new();
    scene.status_at(0, &[child(CHILD, 300.0, 100.0), adult(ADULT, 300.0, 150.0)]);
    let (status, alerts) =
        scene.alerts_at(100, &[child(CHILD, 400.0, 100.0), adult(ADULT, 390.0, 110.0)]);
    assert_eq!(status, SafetyStatus::Safe);
    assert_eq!(alerts, 1);
}

#[test]
fn cooldown_is_tracked_per_child() {
    let mut scene = Scene::new();
    let (_, alerts) = scene.alerts_at(0, &[child(2, 400.0, 100.0), child(3, 420.0, 200.0)]);
    assert_eq!(alerts, 2);
}

#[test]
fn assessment_reports_counts() {
    let mut scene = Scene::new();
    let assessment = scene.engine.evaluate(
        &mut scene.subjects,
        &scene.zone,
        &[
            child(2, 100.0, 100.0),
            child(3, 400.0, 100.0),
            adult(ADULT, 200.0, 100.0),
            child(3, 10.0, 10.0),
        ],
        scene.start,
    );
    assert_eq!(assessment.counts.children, 2, "duplicate ID keeps its first occurrence");
    assert_eq!(assessment.counts.adults, 1);
    assert_eq!(assessment.counts.children_in_zone, 1);
    let verdict = assessment
        .verdicts
        .iter()
        .find(|v| v.id == TrackId(3))
        .expect("verdict for child 3");
    assert!(verdict.in_zone);
    assert_eq!(verdict.nearest_adult.map(|a| a.id), Some(TrackId(ADULT)));
    assert_eq!(verdict.nearest_adult.map(|a| a.distance), Some(200.0));
}
