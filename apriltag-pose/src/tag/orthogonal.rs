//! Homography initialization followed by orthogonal iteration
//! (Lu, Hager & Mjolsness, 2000), with a search for the second local
//! minimum of the planar ambiguity (Schweighofer & Pinz, 2006).

use log::{debug, trace};
use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};

use super::{tag_frame, TagPoseStrategy, CAMERA_FRAME};
use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::euclidean::{nearest_rotation, rotation_distance, Transform};
use crate::field::tag_corners;
use crate::pnp::homography::Homography;
use crate::pnp::{reprojection_error, sort_by_error};

/// Minimum rotation (radians) between the two local minima for the second
/// one to count as distinct.
const DISTINCT_MINIMUM_ANGLE: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct OrthogonalIterationStrategy {
    iterations: u32,
}

impl Default for OrthogonalIterationStrategy {
    fn default() -> Self {
        Self { iterations: 50 }
    }
}

impl OrthogonalIterationStrategy {
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }
}

impl TagPoseStrategy for OrthogonalIterationStrategy {
    fn estimate_tag_poses(
        &self,
        detection: &AprilTagDetection,
        camera: &CameraParameters,
        tag_size: f64,
    ) -> Vec<Transform> {
        let object = tag_corners(tag_size);
        let pixels = detection.corner_points();
        let normalized = camera.undistort_points(&pixels);

        let plane = object.map(|p| Point2::new(p.x, p.y));
        let Some(h) = Homography::from_correspondences(&plane, &normalized) else {
            debug!("tag {}: degenerate corner homography", detection.tag_id);
            return Vec::new();
        };
        let Some((r0, _)) = pose_from_homography(&h) else {
            debug!("tag {}: homography has no pose", detection.tag_id);
            return Vec::new();
        };

        let rays: Vec<Vector3<f64>> = normalized
            .iter()
            .map(|m| Vector3::new(m.x, m.y, 1.0))
            .collect();
        let Some(problem) = ObjectSpaceProblem::new(&rays, &object) else {
            return Vec::new();
        };

        let first = problem.iterate(r0, self.iterations);
        let mut minima = vec![first];
        if let Some(second) = problem.second_minimum(&first, self.iterations) {
            minima.push(second);
        }
        trace!(
            "tag {}: object-space errors {:?}",
            detection.tag_id,
            minima.iter().map(|m| m.error).collect::<Vec<_>>()
        );

        let mut poses: Vec<Transform> = minima
            .into_iter()
            .filter(|m| m.translation.z > 0.0)
            .map(|m| {
                let pose = Transform::new(m.rotation, m.translation);
                let error = reprojection_error(&object, &pixels, camera, &pose);
                pose.with_error(error)
                    .with_frames(tag_frame(detection.tag_id), CAMERA_FRAME)
            })
            .collect();
        sort_by_error(&mut poses);
        poses
    }

    fn name(&self) -> String {
        "orthogonal-iteration".to_string()
    }
}

/// Initial pose from `H ∝ [r1 r2 t]`, with the tag in front of the camera.
fn pose_from_homography(h: &Homography) -> Option<(Rotation3<f64>, Vector3<f64>)> {
    let h1 = h.data.column(0).into_owned();
    let h2 = h.data.column(1).into_owned();
    let scale = 0.5 * (h1.norm() + h2.norm());
    if scale < 1e-12 {
        return None;
    }
    let sign = if h.data[(2, 2)] < 0.0 { -1.0 } else { 1.0 };
    let r1 = h1 * sign / scale;
    let r2 = h2 * sign / scale;
    let t = h.data.column(2) * sign / scale;
    let r = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]));
    Some((r, t))
}

#[derive(Debug, Clone, Copy)]
struct Minimum {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
    /// Sum of squared object-space residuals.
    error: f64,
}

/// Object-space collinearity problem for a fixed set of rays and points.
struct ObjectSpaceProblem<'a> {
    points: &'a [Point3<f64>],
    /// Line-of-sight projectors `v vᵀ / vᵀv`.
    projectors: Vec<Matrix3<f64>>,
    centered: Vec<Vector3<f64>>,
    /// `(I - mean(F))⁻¹`
    translation_factor: Matrix3<f64>,
}

impl<'a> ObjectSpaceProblem<'a> {
    fn new(rays: &[Vector3<f64>], points: &'a [Point3<f64>]) -> Option<Self> {
        let n = points.len() as f64;
        let projectors: Vec<Matrix3<f64>> =
            rays.iter().map(|v| v * v.transpose() / v.norm_squared()).collect();
        let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
        let centered = points.iter().map(|p| p.coords - mean).collect();
        let f_mean = projectors.iter().fold(Matrix3::zeros(), |acc, f| acc + f) / n;
        let translation_factor = (Matrix3::identity() - f_mean).try_inverse()?;
        Some(Self {
            points,
            projectors,
            centered,
            translation_factor,
        })
    }

    /// Optimal translation for a rotation.
    fn translation(&self, r: &Rotation3<f64>) -> Vector3<f64> {
        let n = self.points.len() as f64;
        let sum = self
            .points
            .iter()
            .zip(&self.projectors)
            .fold(Vector3::zeros(), |acc, (p, f)| {
                let rp = r * p.coords;
                acc + (f - Matrix3::identity()) * rp
            });
        self.translation_factor * sum / n
    }

    fn error(&self, r: &Rotation3<f64>, t: &Vector3<f64>) -> f64 {
        self.points
            .iter()
            .zip(&self.projectors)
            .map(|(p, f)| {
                let q = r * p.coords + t;
                ((Matrix3::identity() - f) * q).norm_squared()
            })
            .sum()
    }

    fn iterate(&self, start: Rotation3<f64>, iterations: u32) -> Minimum {
        let mut r = start;
        let mut previous = f64::INFINITY;
        for _ in 0..iterations {
            let t = self.translation(&r);
            let q: Vec<Vector3<f64>> = self
                .points
                .iter()
                .zip(&self.projectors)
                .map(|(p, f)| f * (r * p.coords + t))
                .collect();
            let q_mean = q.iter().fold(Vector3::zeros(), |acc, v| acc + v) / q.len() as f64;
            let m = q
                .iter()
                .zip(&self.centered)
                .fold(Matrix3::zeros(), |acc, (qi, pi)| acc + (qi - q_mean) * pi.transpose());
            r = nearest_rotation(&m);

            let error = self.error(&r, &self.translation(&r));
            if error < 1e-30 || (previous.is_finite() && previous - error <= 1e-12 * previous) {
                break;
            }
            previous = error;
        }
        let translation = self.translation(&r);
        Minimum {
            rotation: r,
            translation,
            error: self.error(&r, &translation),
        }
    }

    /// The other minimum sits near the first pose with its normal reflected
    /// about the line of sight to the tag, in-plane axes unchanged in the
    /// image.
    fn second_minimum(&self, first: &Minimum, iterations: u32) -> Option<Minimum> {
        let t_norm = first.translation.norm();
        if t_norm < 1e-10 {
            return None;
        }
        let n = first.translation / t_norm;
        let reflect = 2.0 * n * n.transpose() - Matrix3::identity();
        let half_turn = Matrix3::from_diagonal(&Vector3::new(-1.0, -1.0, 1.0));
        let start =
            Rotation3::from_matrix_unchecked(reflect * first.rotation.matrix() * half_turn);
        if rotation_distance(&first.rotation, &start) < DISTINCT_MINIMUM_ANGLE {
            return None;
        }
        let second = self.iterate(start, iterations);
        (rotation_distance(&first.rotation, &second.rotation) >= DISTINCT_MINIMUM_ANGLE)
            .then_some(second)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn camera() -> CameraParameters {
        CameraParameters::pinhole(500.0, 500.0, 320.0, 240.0).unwrap()
    }

    #[test]
    fn frontal_tag() {
        let truth = Transform::from_rotation_vector(Vector3::zeros(), Vector3::new(0.0, 0.0, 5.0));
        let det = synthetic_detection(0, &truth, &camera(), 0.1);
        let poses = OrthogonalIterationStrategy::default().estimate_tag_poses(&det, &camera(), 0.1);
        let best = &poses[0];
        assert!(best.angle_to(&truth) < 1e-6);
        assert!((best.translation() - truth.translation()).norm() < 1e-6);
        assert!(best.error().unwrap() < 1e-4, "error={:?}", best.error());
    }

    #[test]
    fn offset_tag() {
        let truth = Transform::from_rotation_vector(Vector3::zeros(), Vector3::new(1.0, 0.0, 3.0));
        let det = synthetic_detection(0, &truth, &camera(), 0.2);
        let poses = OrthogonalIterationStrategy::default().estimate_tag_poses(&det, &camera(), 0.2);
        assert!((poses[0].translation() - truth.translation()).norm() < 1e-6);
        assert!(poses[0].error().unwrap() < 1e-4);
    }

    #[test]
    fn oblique_tag_finds_two_minima() {
        let det = synthetic_detection(0, &oblique_pose(), &camera(), 0.2);
        let poses = OrthogonalIterationStrategy::default().estimate_tag_poses(&det, &camera(), 0.2);
        assert_eq!(poses.len(), 2, "{poses:?}");
        assert!(poses[0].error() <= poses[1].error());
        assert!(poses[0].angle_to(&oblique_pose()) < 1e-5);
        assert!((poses[0].translation().z - 3.0).abs() < 1e-4);
        assert!(poses[1].angle_to(&poses[0]) > DISTINCT_MINIMUM_ANGLE);
    }

    #[test]
    fn degenerate_detection() {
        let mut det = synthetic_detection(0, &oblique_pose(), &camera(), 0.1);
        det.corners = [[320.0, 240.0]; 4];
        assert!(OrthogonalIterationStrategy::default()
            .estimate_tag_poses(&det, &camera(), 0.1)
            .is_empty());
    }

    #[test]
    fn homography_pose_faces_camera() {
        let truth = oblique_pose();
        let object = tag_corners(0.2);
        let plane = object.map(|p| Point2::new(p.x, p.y));
        let image: Vec<_> = object
            .iter()
            .map(|p| {
                let q = truth.transform_point(p);
                Point2::new(q.x / q.z, q.y / q.z)
            })
            .collect();
        let h = Homography::from_correspondences(&plane, &image).unwrap();
        let (r, t) = pose_from_homography(&h).unwrap();
        assert!(t.z > 0.0);
        assert!(rotation_distance(&r, truth.rotation()) < 1e-8);
        assert!((t - truth.translation()).norm() < 1e-8);
    }
}
