//! Per-tag pose estimation.
//!
//! A [`TagPoseStrategy`] turns one detection into candidate poses of that
//! tag in the camera frame. It never fuses across tags; that is the job of
//! [`LocalizationStrategy`](crate::localization::LocalizationStrategy).

mod orthogonal;
mod pnp;

pub use orthogonal::OrthogonalIterationStrategy;
pub use pnp::PerspectiveNPointStrategy;

#[cfg(feature = "parallel")]
use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};

use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::euclidean::Transform;

/// Frame name given to the camera side of every pose this crate produces.
pub const CAMERA_FRAME: &str = "camera";

/// Frame name of a single tag, e.g. `tag7`.
pub fn tag_frame(tag_id: u32) -> String {
    format!("tag{tag_id}")
}

pub trait TagPoseStrategy: Send + Sync {
    /// Candidate poses (tag frame to camera frame), sorted by ascending
    /// reprojection error. Empty when the tag cannot be solved.
    fn estimate_tag_poses(
        &self,
        detection: &AprilTagDetection,
        camera: &CameraParameters,
        tag_size: f64,
    ) -> Vec<Transform>;

    fn name(&self) -> String;
}

/// Replace every detection's `tag_poses` with the strategy's candidates.
pub fn annotate_detections<S: TagPoseStrategy + ?Sized>(
    strategy: &S,
    detections: &mut [AprilTagDetection],
    camera: &CameraParameters,
    tag_size: f64,
) {
    #[cfg(feature = "parallel")]
    {
        detections.par_iter_mut().for_each(|det| {
            det.tag_poses = strategy.estimate_tag_poses(det, camera, tag_size);
        });
    }

    #[cfg(not(feature = "parallel"))]
    {
        detections.iter_mut().for_each(|det| {
            det.tag_poses = strategy.estimate_tag_poses(det, camera, tag_size);
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use nalgebra::Vector3;

    use crate::camera::CameraParameters;
    use crate::detection::AprilTagDetection;
    use crate::euclidean::Transform;
    use crate::field::tag_corners;

    /// Render a tag of `tag_size` seen at `pose` (tag to camera) as a detection.
    pub fn synthetic_detection(
        tag_id: u32,
        pose: &Transform,
        camera: &CameraParameters,
        tag_size: f64,
    ) -> AprilTagDetection {
        let corners = tag_corners(tag_size).map(|p| {
            let q = camera.project(&pose.transform_point(&p));
            [q.x, q.y]
        });
        let center = camera.project(&pose.transform_point(&nalgebra::Point3::origin()));
        AprilTagDetection::new(tag_id, "tag36h11", [center.x, center.y], corners)
    }

    pub fn oblique_pose() -> Transform {
        Transform::from_rotation_vector(Vector3::new(0.0, 0.7, 0.0), Vector3::new(0.0, 0.0, 3.0))
    }
}
