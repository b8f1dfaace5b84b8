//! Infinitesimal Plane-based Pose Estimation (Collins & Bartoli, IJCV 2014).
//!
//! The homography from the object plane to the image is differentiated at
//! the plane origin. Its 2x2 Jacobian fixes the rotation up to a reflection
//! about the viewing ray, which yields the two solutions of the planar
//! ambiguity in closed form.

use nalgebra::{Matrix2, Matrix3, Point2, Point3, Rotation3, Vector2, Vector3};

use super::homography::Homography;
use super::{translation_for_rotation, PointSpread, Solution};
use crate::error::EstimationError;
use crate::pnp::PnpMethod;

pub(crate) fn solve(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Vec<Solution>, EstimationError> {
    if object_points.len() != 4 {
        return Err(EstimationError::WrongPointCount {
            method: PnpMethod::Ippe,
            required: 4,
            actual: object_points.len(),
        });
    }
    let spread = PointSpread::of(object_points);
    if spread.is_collinear() {
        return Err(EstimationError::Collinear);
    }
    if !spread.is_planar() {
        return Err(EstimationError::NotCoplanar);
    }

    // Work in a plane frame centered on the centroid, so the Jacobian is
    // taken at the middle of the target.
    let frame = spread.plane_frame();
    let plane = frame.project(object_points);
    let h = Homography::from_correspondences(&plane, normalized)
        .ok_or(EstimationError::Degenerate("plane-to-image homography"))?
        .data;
    if h[(2, 2)].abs() < 1e-12 {
        return Err(EstimationError::Degenerate("target centroid on the camera plane"));
    }
    let h = h / h[(2, 2)];

    let v = Vector2::new(h[(0, 2)], h[(1, 2)]);
    let jacobian = Matrix2::new(
        h[(0, 0)] - h[(2, 0)] * h[(0, 2)],
        h[(0, 1)] - h[(2, 1)] * h[(0, 2)],
        h[(1, 0)] - h[(2, 0)] * h[(1, 2)],
        h[(1, 1)] - h[(2, 1)] * h[(1, 2)],
    );
    let rotations = rotations_from_jacobian(&jacobian, &v)
        .ok_or(EstimationError::Degenerate("zero homography Jacobian"))?;

    let plane3: Vec<Point3<f64>> = plane.iter().map(|p| Point3::new(p.x, p.y, 0.0)).collect();
    let mut solutions = Vec::with_capacity(2);
    for rotation in rotations {
        let translation = translation_for_rotation(&plane3, normalized, &rotation)
            .ok_or(EstimationError::Degenerate("translation system is singular"))?;
        solutions.push(frame.to_object(Solution {
            rotation,
            translation,
        }));
    }
    Ok(solutions)
}

/// Both rotations consistent with the homography Jacobian `j` at the plane
/// origin, whose image is the normalized point `v`.
fn rotations_from_jacobian(j: &Matrix2<f64>, v: &Vector2<f64>) -> Option<[Rotation3<f64>; 2]> {
    // Rv maps the optical axis onto the ray through v.
    let ray = Vector3::new(v.x, v.y, 1.0).normalize();
    let rv = Rotation3::rotation_between(&Vector3::z(), &ray)?.into_inner();

    let b = Matrix2::new(
        rv[(0, 0)] - v.x * rv[(2, 0)],
        rv[(0, 1)] - v.x * rv[(2, 1)],
        rv[(1, 0)] - v.y * rv[(2, 0)],
        rv[(1, 1)] - v.y * rv[(2, 1)],
    );
    let a = b.try_inverse()? * j;

    // Largest singular value of A.
    let aat = a * a.transpose();
    let gamma2 = 0.5
        * (aat[(0, 0)]
            + aat[(1, 1)]
            + ((aat[(0, 0)] - aat[(1, 1)]).powi(2) + 4.0 * aat[(0, 1)].powi(2)).sqrt());
    let gamma = gamma2.sqrt();
    if !gamma.is_finite() || gamma < f64::from(f32::EPSILON) {
        return None;
    }

    let rt = a / gamma;
    let b0 = (1.0 - rt[(0, 0)].powi(2) - rt[(1, 0)].powi(2)).max(0.0).sqrt();
    let mut b1 = (1.0 - rt[(0, 1)].powi(2) - rt[(1, 1)].powi(2)).max(0.0).sqrt();
    let sp = -rt[(0, 0)] * rt[(0, 1)] - rt[(1, 0)] * rt[(1, 1)];
    if sp < 0.0 {
        b1 = -b1;
    }

    let build = |sign: f64| {
        let c0 = Vector3::new(rt[(0, 0)], rt[(1, 0)], sign * b0);
        let c1 = Vector3::new(rt[(0, 1)], rt[(1, 1)], sign * b1);
        let c2 = c0.cross(&c1);
        Rotation3::from_matrix_unchecked(rv * Matrix3::from_columns(&[c0, c1, c2]))
    };
    Some([build(1.0), build(-1.0)])
}
