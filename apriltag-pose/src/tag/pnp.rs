use log::debug;

use super::{tag_frame, TagPoseStrategy, CAMERA_FRAME};
use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::euclidean::Transform;
use crate::field::tag_corners;
use crate::pnp::{solve_pnp, sort_by_error, PnpMethod};

/// Solves each tag on its own against the tag's four corners.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerspectiveNPointStrategy {
    pub method: PnpMethod,
}

impl PerspectiveNPointStrategy {
    pub fn new(method: PnpMethod) -> Self {
        Self { method }
    }
}

impl TagPoseStrategy for PerspectiveNPointStrategy {
    fn estimate_tag_poses(
        &self,
        detection: &AprilTagDetection,
        camera: &CameraParameters,
        tag_size: f64,
    ) -> Vec<Transform> {
        let object = tag_corners(tag_size);
        match solve_pnp(&object, &detection.corner_points(), camera, self.method) {
            Ok(mut candidates) => {
                sort_by_error(&mut candidates);
                candidates
                    .into_iter()
                    .map(|c| c.with_frames(tag_frame(detection.tag_id), CAMERA_FRAME))
                    .collect()
            }
            Err(e) => {
                debug!("tag {}: {} failed: {e}", detection.tag_id, self.method);
                Vec::new()
            }
        }
    }

    fn name(&self) -> String {
        format!("pnp-{}", self.method)
    }
}
