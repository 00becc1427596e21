use serde::{Deserialize, Serialize};

use crate::Point;

/// Keypoints needed to reach the hips (COCO index 12).
pub const MIN_KEYPOINTS: usize = 13;

const HEAD: usize = 0;
const LEFT_SHOULDER: usize = 5;
const RIGHT_SHOULDER: usize = 6;
const LEFT_HIP: usize = 11;
const RIGHT_HIP: usize = 12;

/// Body proportions used to tell adults from children.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BodyFeatures {
    /// Head to hip midpoint, pixels, 2 decimals.
    pub body_height: f32,
    /// Shoulder width over body height, 3 decimals (0 when height is 0).
    pub shoulder_body_ratio: f32,
}

impl BodyFeatures {
    pub fn as_array(&self) -> [f32; 2] {
        [self.body_height, self.shoulder_body_ratio]
    }
}

/// `None` when fewer than `MIN_KEYPOINTS` keypoints are present.
pub fn extract_features(keypoints: &[Point]) -> Option<BodyFeatures> {
    if keypoints.len() < MIN_KEYPOINTS {
        return None;
    }
    let hip_mid = Point::new(
        (keypoints[LEFT_HIP].x + keypoints[RIGHT_HIP].x) / 2.0,
        (keypoints[LEFT_HIP].y + keypoints[RIGHT_HIP].y) / 2.0,
    );
    let body_height = keypoints[HEAD].distance(hip_mid);
    let shoulder_width = keypoints[LEFT_SHOULDER].distance(keypoints[RIGHT_SHOULDER]);
    let ratio = if body_height != 0.0 {
        shoulder_width / body_height
    } else {
        0.0
    };
    Some(BodyFeatures {
        body_height: round_to(body_height, 2),
        shoulder_body_ratio: round_to(ratio, 3),
    })
}

pub(crate) fn round_to(value: f32, decimals: i32) -> f32 {
    let scale = 10f32.powi(decimals);
    (value * scale).round() / scale
}
