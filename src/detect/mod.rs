mod classifier;
mod features;
mod scripted;
mod tracker;

pub use classifier::{Classification, HeightRatioClassifier, LogisticRoleClassifier, RoleClassifier};
pub use features::{extract_features, BodyFeatures, MIN_KEYPOINTS};
pub use scripted::ScriptedTracker;
pub use tracker::{run_tracker, BoundingBox, DetectOutcome, NullTracker, PersonTracker, TrackedPerson};
