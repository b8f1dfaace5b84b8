use nalgebra::Point2;

use crate::euclidean::Transform;

/// One observed tag, as reported by a marker detector.
///
/// Corners follow the detector's winding, which must match the tag-frame
/// corner order used by [`AprilTagField`](crate::field::AprilTagField).
/// `tag_poses` holds per-tag candidate poses (tag frame to camera frame),
/// empty until a [`TagPoseStrategy`](crate::tag::TagPoseStrategy) fills it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AprilTagDetection {
    #[cfg_attr(feature = "serde", serde(alias = "id"))]
    pub tag_id: u32,
    #[cfg_attr(feature = "serde", serde(alias = "family"))]
    pub tag_family: String,
    pub center: [f64; 2],
    pub corners: [[f64; 2]; 4],
    #[cfg_attr(feature = "serde", serde(default))]
    pub decision_margin: f32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub hamming: u32,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Vec::is_empty")
    )]
    pub tag_poses: Vec<Transform>,
}

impl AprilTagDetection {
    /// A detection with no candidate poses.
    pub fn new(
        tag_id: u32,
        tag_family: impl Into<String>,
        center: [f64; 2],
        corners: [[f64; 2]; 4],
    ) -> Self {
        Self {
            tag_id,
            tag_family: tag_family.into(),
            center,
            corners,
            decision_margin: 0.0,
            hamming: 0,
            tag_poses: Vec::new(),
        }
    }

    pub fn corner_points(&self) -> [Point2<f64>; 4] {
        self.corners.map(|[x, y]| Point2::new(x, y))
    }

    /// Lowest-error candidate pose, if any were computed.
    pub fn best_pose(&self) -> Option<&Transform> {
        self.tag_poses
            .iter()
            .min_by(|a, b| error_key(a).total_cmp(&error_key(b)))
    }
}

fn error_key(t: &Transform) -> f64 {
    t.error().unwrap_or(f64::INFINITY)
}

/// A marker detector that can feed [`CameraLocalizer`](crate::localization::CameraLocalizer).
pub trait TagDetector {
    type Image: ?Sized;

    fn detect(&self, image: &Self::Image) -> Vec<AprilTagDetection>;
}
