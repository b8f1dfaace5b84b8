use std::sync::Arc;

use log::{debug, trace};

use super::LocalizationStrategy;
use crate::camera::CameraParameters;
use crate::detection::{AprilTagDetection, TagDetector};
use crate::euclidean::Transform;
use crate::field::AprilTagField;
use crate::tag::CAMERA_FRAME;

/// Outcome of one localization call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LocalizationResult {
    /// World origin in the camera frame, if any estimate was possible.
    pub estimated_pose: Option<Transform>,
    /// The detections handed to the strategy, after filtering.
    pub detections: Vec<AprilTagDetection>,
}

/// A strategy bound to a field and a camera.
///
/// Detections of tags the field does not know, or of another tag family,
/// are dropped before the strategy sees them.
pub struct CameraLocalizer {
    strategy: Box<dyn LocalizationStrategy>,
    field: Arc<AprilTagField>,
    camera: CameraParameters,
}

impl std::fmt::Debug for CameraLocalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraLocalizer")
            .field("strategy", &self.strategy.name())
            .field("field", &self.field)
            .field("camera", &self.camera)
            .finish()
    }
}

impl CameraLocalizer {
    pub fn new(
        strategy: impl LocalizationStrategy + 'static,
        field: impl Into<Arc<AprilTagField>>,
        camera: CameraParameters,
    ) -> Self {
        Self {
            strategy: Box::new(strategy),
            field: field.into(),
            camera,
        }
    }

    pub fn strategy(&self) -> &dyn LocalizationStrategy {
        self.strategy.as_ref()
    }

    pub fn field(&self) -> &AprilTagField {
        &self.field
    }

    pub fn camera(&self) -> &CameraParameters {
        &self.camera
    }

    pub fn localize(
        &self,
        detections: impl IntoIterator<Item = AprilTagDetection>,
    ) -> LocalizationResult {
        let detections: Vec<AprilTagDetection> = detections
            .into_iter()
            .filter(|det| {
                let known = self.field.contains(det.tag_id)
                    && det.tag_family == self.field.tag_family();
                if !known {
                    trace!("ignoring {} tag {}", det.tag_family, det.tag_id);
                }
                known
            })
            .collect();

        let mut estimated_pose = self.strategy.estimate(&detections, &self.field, &self.camera);
        if estimated_pose.is_none() && !detections.is_empty() {
            debug!("{}: no pose from {} detection(s)", self.strategy.name(), detections.len());
        }
        if let Some(frame) = self.field.frame() {
            estimated_pose = estimated_pose.map(|pose| pose.with_frames(frame, CAMERA_FRAME));
        }

        LocalizationResult {
            estimated_pose,
            detections,
        }
    }

    /// Runs `detector` on `image`, then [`localize`](Self::localize).
    pub fn localize_image<D: TagDetector + ?Sized>(
        &self,
        detector: &D,
        image: &D::Image,
    ) -> LocalizationResult {
        self.localize(detector.detect(image))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{LowestAmbiguityStrategy, MultiTagPnpStrategy};
    use super::*;

    /// Replays a fixed list, ignoring the image.
    struct Replay(Vec<AprilTagDetection>);

    impl TagDetector for Replay {
        type Image = [u8];

        fn detect(&self, _image: &[u8]) -> Vec<AprilTagDetection> {
            self.0.clone()
        }
    }

    fn strategy() -> MultiTagPnpStrategy {
        MultiTagPnpStrategy::default()
            .with_fallback(Box::new(LowestAmbiguityStrategy::default()))
            .unwrap()
    }

    #[test]
    fn drops_unknown_tags_and_foreign_families() {
        let truth = world_in_camera();
        let mut dets = detections(&[1, 2], &truth);
        dets.push(AprilTagDetection::new(42, "tag36h11", [0.0, 0.0], [[0.0, 0.0]; 4]));
        let mut foreign = detections(&[3], &truth).remove(0);
        foreign.tag_family = "tag16h5".to_string();
        dets.push(foreign);

        let localizer = CameraLocalizer::new(strategy(), field(), camera());
        let result = localizer.localize(dets);
        let used: Vec<u32> = result.detections.iter().map(|d| d.tag_id).collect();
        assert_eq!(used, [1, 2]);
        let pose = result.estimated_pose.expect("pose");
        assert!(pose.angle_to(&truth) < 1e-6);
        assert!((pose.translation() - truth.translation()).norm() < 1e-6);
        assert_eq!(pose.input_frame(), None);
    }

    #[test]
    fn named_field_tags_result_frames() {
        let truth = world_in_camera();
        let localizer = CameraLocalizer::new(strategy(), field().with_frame("world"), camera());
        let pose = localizer.localize(detections(&[1, 3], &truth)).estimated_pose.unwrap();
        assert_eq!(pose.input_frame(), Some("world"));
        assert_eq!(pose.output_frame(), Some(CAMERA_FRAME));
    }

    #[test]
    fn nothing_detected() {
        let localizer = CameraLocalizer::new(strategy(), field(), camera());
        let result = localizer.localize(Vec::new());
        assert_eq!(
            result,
            LocalizationResult {
                estimated_pose: None,
                detections: Vec::new(),
            }
        );
    }

    #[test]
    fn localizes_detector_output() {
        let truth = world_in_camera();
        let detector = Replay(detections(&[2, 3], &truth));
        let shared = Arc::new(field());
        let localizer = CameraLocalizer::new(strategy(), Arc::clone(&shared), camera());
        let result = localizer.localize_image(&detector, &[0u8; 16][..]);
        assert_eq!(result.detections.len(), 2);
        assert!(result.estimated_pose.unwrap().angle_to(&truth) < 1e-6);
        assert_eq!(localizer.strategy().name(), "multi-tag-pnp-sqpnp");
        assert_eq!(localizer.field().len(), shared.len());
    }
}
