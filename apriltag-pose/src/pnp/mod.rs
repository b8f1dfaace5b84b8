//! Perspective-N-Point solvers.
//!
//! All solvers work on undistorted, normalized image coordinates and return
//! poses mapping the object frame into the camera frame. [`solve_pnp`] wraps
//! them with input validation, undistortion, and per-candidate reprojection
//! error in pixels.

pub mod homography;
mod ippe;
mod iterative;
mod p3p;
mod sqpnp;

use std::fmt;
use std::str::FromStr;

use log::trace;
use nalgebra::{Matrix3, Point2, Point3, Rotation3, SymmetricEigen, Vector3};

use crate::camera::CameraParameters;
use crate::error::EstimationError;
use crate::euclidean::Transform;

/// Relative eigenvalue threshold below which a point cloud is treated as
/// flat (or thin) along that axis.
const FLATNESS_TOLERANCE: f64 = 1e-10;

/// Numerical method used to solve a PnP problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum PnpMethod {
    /// Levenberg-Marquardt minimization of the reprojection error, started
    /// from a homography (planar targets) or DLT (general targets) guess.
    /// Single solution.
    #[default]
    Iterative,
    /// Closed-form three-point solver. Up to four solutions.
    Ap3p,
    /// Infinitesimal plane-based pose estimation. Exactly four coplanar
    /// points; always returns both solutions of the planar ambiguity.
    Ippe,
    /// Globally optimal sequential quadratic programming solver. Single
    /// solution.
    Sqpnp,
}

impl PnpMethod {
    pub const ALL: [PnpMethod; 4] = [
        PnpMethod::Iterative,
        PnpMethod::Ap3p,
        PnpMethod::Ippe,
        PnpMethod::Sqpnp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PnpMethod::Iterative => "iterative",
            PnpMethod::Ap3p => "ap3p",
            PnpMethod::Ippe => "ippe",
            PnpMethod::Sqpnp => "sqpnp",
        }
    }

    /// Whether the method only accepts a single planar tag's corners.
    pub fn is_planar_only(&self) -> bool {
        matches!(self, PnpMethod::Ippe)
    }
}

impl fmt::Display for PnpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PnpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PnpMethod::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown PnP method: {s}"))
    }
}

/// A raw solver output: object frame to camera frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Solution {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Solution {
    fn depth_of(&self, p: &Point3<f64>) -> f64 {
        (self.rotation * p).z + self.translation.z
    }
}

/// Solve a PnP problem.
///
/// Every returned candidate carries its reprojection RMSE in pixels. The
/// candidates are not sorted; use [`sort_by_error`]. Candidates that place
/// the object behind the camera are discarded, and an empty result is an
/// [`EstimationError::NoSolution`].
pub fn solve_pnp(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    camera: &CameraParameters,
    method: PnpMethod,
) -> Result<Vec<Transform>, EstimationError> {
    if object_points.len() != image_points.len() {
        return Err(EstimationError::MismatchedLengths {
            object: object_points.len(),
            image: image_points.len(),
        });
    }
    let finite = object_points.iter().all(|p| p.iter().all(|v| v.is_finite()))
        && image_points.iter().all(|p| p.iter().all(|v| v.is_finite()));
    if !finite {
        return Err(EstimationError::NonFinite);
    }

    let normalized = camera.undistort_points(image_points);
    let solutions = match method {
        PnpMethod::Iterative => iterative::solve(object_points, &normalized)?,
        PnpMethod::Ap3p => p3p::solve(object_points, &normalized)?,
        PnpMethod::Ippe => ippe::solve(object_points, &normalized)?,
        PnpMethod::Sqpnp => sqpnp::solve(object_points, &normalized)?,
    };

    let centroid = centroid(object_points);
    let candidates: Vec<Transform> = solutions
        .into_iter()
        .filter(|s| s.depth_of(&centroid) > 0.0)
        .map(|s| {
            let pose = Transform::new(s.rotation, s.translation);
            let error = reprojection_error(object_points, image_points, camera, &pose);
            pose.with_error(error)
        })
        .collect();

    trace!(
        "{method}: {} candidate(s) from {} points, errors {:?}",
        candidates.len(),
        object_points.len(),
        candidates.iter().filter_map(Transform::error).collect::<Vec<_>>()
    );

    if candidates.is_empty() {
        return Err(EstimationError::NoSolution);
    }
    Ok(candidates)
}

/// Root-mean-square reprojection error in pixels, `sqrt(Σ‖d‖² / 2N)`.
///
/// Infinite if any point projects onto or behind the image plane.
pub fn reprojection_error(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    camera: &CameraParameters,
    pose: &Transform,
) -> f64 {
    if object_points.is_empty() {
        return 0.0;
    }
    let mut sum_sq = 0.0;
    for (object, image) in object_points.iter().zip(image_points) {
        let in_camera = pose.transform_point(object);
        if in_camera.z <= 1e-12 {
            return f64::INFINITY;
        }
        sum_sq += (camera.project(&in_camera) - image).norm_squared();
    }
    (sum_sq / (2.0 * object_points.len() as f64)).sqrt()
}

/// Sort candidates by ascending error; candidates without one go last.
pub fn sort_by_error(candidates: &mut [Transform]) {
    candidates.sort_by(|a, b| {
        let ea = a.error().unwrap_or(f64::INFINITY);
        let eb = b.error().unwrap_or(f64::INFINITY);
        ea.total_cmp(&eb)
    });
}

// ── Shared geometry ──

pub(crate) fn centroid(points: &[Point3<f64>]) -> Point3<f64> {
    let sum = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Point3::from(sum / points.len().max(1) as f64)
}

/// Principal axes of a point cloud.
pub(crate) struct PointSpread {
    pub centroid: Point3<f64>,
    /// Eigenvalues of the scatter matrix, ascending.
    pub eigenvalues: [f64; 3],
    /// Matching unit eigenvectors.
    pub axes: [Vector3<f64>; 3],
}

impl PointSpread {
    pub fn of(points: &[Point3<f64>]) -> Self {
        let centroid = centroid(points);
        let scatter = points.iter().fold(Matrix3::zeros(), |acc, p| {
            let d = p - centroid;
            acc + d * d.transpose()
        });
        let eigen = SymmetricEigen::new(scatter);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        PointSpread {
            centroid,
            eigenvalues: order.map(|i| eigen.eigenvalues[i]),
            axes: order.map(|i| eigen.eigenvectors.column(i).into_owned()),
        }
    }

    pub fn is_planar(&self) -> bool {
        self.eigenvalues[0] <= FLATNESS_TOLERANCE * self.eigenvalues[2]
    }

    pub fn is_collinear(&self) -> bool {
        self.eigenvalues[2] <= 0.0
            || self.eigenvalues[1] <= FLATNESS_TOLERANCE * self.eigenvalues[2]
    }

    /// Frame with z along the plane normal: `p_plane = R (p - centroid)`.
    pub fn plane_frame(&self) -> PlaneFrame {
        let u = self.axes[2];
        let n = self.axes[0];
        let v = n.cross(&u);
        let r = Matrix3::from_rows(&[u.transpose(), v.transpose(), n.transpose()]);
        PlaneFrame {
            centroid: self.centroid,
            rotation: Rotation3::from_matrix_unchecked(r),
        }
    }
}

/// Rigid map from object coordinates onto a plane-aligned frame.
pub(crate) struct PlaneFrame {
    pub centroid: Point3<f64>,
    pub rotation: Rotation3<f64>,
}

impl PlaneFrame {
    /// In-plane (x, y) coordinates of each point.
    pub fn project(&self, points: &[Point3<f64>]) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| {
                let q = self.rotation * (p - self.centroid);
                Point2::new(q.x, q.y)
            })
            .collect()
    }

    /// Convert a pose of the plane frame into a pose of the object frame.
    pub fn to_object(&self, plane_pose: Solution) -> Solution {
        let rotation = plane_pose.rotation * self.rotation;
        Solution {
            rotation,
            translation: plane_pose.translation - rotation * self.centroid.coords,
        }
    }
}

/// Translation minimizing the algebraic error for a fixed rotation.
///
/// For each point, `x (R p + t)_z = (R p + t)_x` and likewise for y.
pub(crate) fn translation_for_rotation(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
    rotation: &Rotation3<f64>,
) -> Option<Vector3<f64>> {
    let mut ata = Matrix3::zeros();
    let mut atb = Vector3::zeros();
    for (p, m) in object_points.iter().zip(normalized) {
        let rp = rotation * p;
        let rows = [
            (Vector3::new(1.0, 0.0, -m.x), m.x * rp.z - rp.x),
            (Vector3::new(0.0, 1.0, -m.y), m.y * rp.z - rp.y),
        ];
        for (a, b) in rows {
            ata += a * a.transpose();
            atb += a * b;
        }
    }
    ata.try_inverse().map(|inv| inv * atb)
}
