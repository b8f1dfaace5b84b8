//! Iterative PnP: a closed-form initial guess refined by Levenberg-Marquardt
//! on the reprojection error in normalized image coordinates.

use log::trace;
use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix6, Point2, Point3, Rotation3, SMatrix, SymmetricEigen,
    Vector3, Vector6,
};

use super::homography::Homography;
use super::{PointSpread, Solution};
use crate::error::EstimationError;
use crate::euclidean::{nearest_rotation, rotation_vector};
use crate::pnp::PnpMethod;

const MAX_ITERATIONS: usize = 50;
const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING: f64 = 1e10;
const JACOBIAN_STEP: f64 = 1e-7;

pub(crate) fn solve(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Vec<Solution>, EstimationError> {
    let n = object_points.len();
    if n < 4 {
        return Err(EstimationError::InsufficientPoints {
            method: PnpMethod::Iterative,
            required: 4,
            actual: n,
        });
    }
    let spread = PointSpread::of(object_points);
    if spread.is_collinear() {
        return Err(EstimationError::Collinear);
    }

    let initial = if spread.is_planar() {
        planar_guess(&spread, object_points, normalized)?
    } else {
        if n < 6 {
            return Err(EstimationError::InsufficientPoints {
                method: PnpMethod::Iterative,
                required: 6,
                actual: n,
            });
        }
        dlt_guess(&spread, object_points, normalized)?
    };

    Ok(vec![refine(object_points, normalized, initial)])
}

/// Pose from the plane-to-image homography, `H ∝ [r1 r2 t]`.
fn planar_guess(
    spread: &PointSpread,
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Solution, EstimationError> {
    let frame = spread.plane_frame();
    let plane = frame.project(object_points);
    let h = Homography::from_correspondences(&plane, normalized)
        .ok_or(EstimationError::Degenerate("plane-to-image homography"))?
        .data;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let scale = 0.5 * (h1.norm() + h2.norm());
    if scale < 1e-12 {
        return Err(EstimationError::Degenerate("vanishing homography"));
    }
    let mut r1 = h1 / scale;
    let mut r2 = h2 / scale;
    let mut t = h.column(2) / scale;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]));
    Ok(frame.to_object(Solution {
        rotation,
        translation: t,
    }))
}

/// Direct linear transform of the 3x4 projection matrix. Object points are
/// centered and scaled first to keep the system well conditioned.
fn dlt_guess(
    spread: &PointSpread,
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Solution, EstimationError> {
    let c = spread.centroid;
    let spread_sum: f64 = object_points.iter().map(|p| (p - c).norm()).sum();
    let s = spread_sum / object_points.len() as f64;

    let mut ata = SMatrix::<f64, 12, 12>::zeros();
    for (p, m) in object_points.iter().zip(normalized) {
        let q = (p - c) / s;
        let row_u = SMatrix::<f64, 1, 12>::from_row_slice(&[
            q.x, q.y, q.z, 1.0, 0.0, 0.0, 0.0, 0.0, -m.x * q.x, -m.x * q.y, -m.x * q.z, -m.x,
        ]);
        let row_v = SMatrix::<f64, 1, 12>::from_row_slice(&[
            0.0, 0.0, 0.0, 0.0, q.x, q.y, q.z, 1.0, -m.y * q.x, -m.y * q.y, -m.y * q.z, -m.y,
        ]);
        ata += row_u.transpose() * row_u + row_v.transpose() * row_v;
    }
    let eigen = SymmetricEigen::new(ata);
    let smallest = eigen.eigenvalues.imin();
    let p = eigen.eigenvectors.column(smallest);

    let mut m = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
    let mut p4 = Vector3::new(p[3], p[7], p[11]);
    if m.determinant() < 0.0 {
        m = -m;
        p4 = -p4;
    }
    let singular_values = m.svd(false, false).singular_values;
    let k = singular_values.sum() / 3.0 / s;
    if !k.is_finite() || k < 1e-12 {
        return Err(EstimationError::Degenerate("projection matrix has no rotation part"));
    }
    let rotation = nearest_rotation(&m);
    Ok(Solution {
        rotation,
        translation: p4 / k - rotation * c.coords,
    })
}

fn residuals(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
    params: &Vector6<f64>,
) -> DVector<f64> {
    let rotation = Rotation3::new(params.fixed_rows::<3>(0).into_owned());
    let t = params.fixed_rows::<3>(3);
    let mut r = DVector::zeros(2 * object_points.len());
    for (i, (p, m)) in object_points.iter().zip(normalized).enumerate() {
        let q = rotation * p.coords + t;
        r[2 * i] = q.x / q.z - m.x;
        r[2 * i + 1] = q.y / q.z - m.y;
    }
    r
}

/// Levenberg-Marquardt over `[rotation vector, translation]`.
fn refine(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
    initial: Solution,
) -> Solution {
    let mut params = Vector6::zeros();
    params
        .fixed_rows_mut::<3>(0)
        .copy_from(&rotation_vector(&initial.rotation));
    params.fixed_rows_mut::<3>(3).copy_from(&initial.translation);

    let mut r = residuals(object_points, normalized, &params);
    let mut cost = r.norm_squared();
    let mut lambda = INITIAL_DAMPING;
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS && cost.is_finite() && cost > 1e-30 {
        iterations += 1;

        // Central differences.
        let mut jacobian = DMatrix::zeros(r.len(), 6);
        for k in 0..6 {
            let h = JACOBIAN_STEP * params[k].abs().max(1.0);
            let mut forward = params;
            let mut backward = params;
            forward[k] += h;
            backward[k] -= h;
            let column = (residuals(object_points, normalized, &forward)
                - residuals(object_points, normalized, &backward))
                / (2.0 * h);
            jacobian.set_column(k, &column);
        }
        let jtj: Matrix6<f64> = (jacobian.transpose() * &jacobian)
            .fixed_view::<6, 6>(0, 0)
            .into_owned();
        let jtr: Vector6<f64> = (jacobian.transpose() * &r).fixed_rows::<6>(0).into_owned();

        let mut accepted = false;
        while lambda < MAX_DAMPING {
            let damped = jtj + Matrix6::identity() * lambda;
            let Some(step) = damped.lu().solve(&(-jtr)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = params + step;
            let candidate_r = residuals(object_points, normalized, &candidate);
            let candidate_cost = candidate_r.norm_squared();
            if candidate_cost < cost {
                let improvement = cost - candidate_cost;
                params = candidate;
                r = candidate_r;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                accepted = true;
                if improvement <= 1e-12 * cost || step.norm() < 1e-14 {
                    lambda = MAX_DAMPING;
                }
                break;
            }
            lambda *= 10.0;
        }
        if !accepted || lambda >= MAX_DAMPING {
            break;
        }
    }
    trace!("iterative PnP: {iterations} LM iteration(s), cost {cost:e}");

    Solution {
        rotation: Rotation3::new(params.fixed_rows::<3>(0).into_owned()),
        translation: params.fixed_rows::<3>(3).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::solve_pnp;
    use super::*;
    use crate::euclidean::Transform;
    use crate::field::tag_corners;

    #[test]
    fn general_points_converge() {
        let obj = cube_points();
        let truth = ground_truth();
        let img = project_all(&obj, &camera(), &truth);
        let candidates = solve_pnp(&obj, &img, &camera(), PnpMethod::Iterative).unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].error().unwrap() < 1e-6);
        assert_pose_close(&candidates[0], &truth, 1e-7);
    }

    #[test]
    fn dlt_alone_is_exact_on_clean_data() {
        let obj = cube_points();
        let truth = ground_truth();
        let normalized = camera().undistort_points(&project_all(&obj, &camera(), &truth));
        let guess = dlt_guess(&PointSpread::of(&obj), &obj, &normalized).unwrap();
        let pose = Transform::new(guess.rotation, guess.translation);
        assert_pose_close(&pose, &truth, 1e-6);
    }

    #[test]
    fn refinement_recovers_from_a_poor_start() {
        let obj = tag_corners(0.2).to_vec();
        let truth = ground_truth();
        let normalized = camera().undistort_points(&project_all(&obj, &camera(), &truth));
        let start = Solution {
            rotation: Rotation3::new(truth.rotation_vector() + Vector3::new(0.05, -0.03, 0.02)),
            translation: truth.translation() + Vector3::new(0.02, 0.01, -0.1),
        };
        let refined = refine(&obj, &normalized, start);
        assert_pose_close(&Transform::new(refined.rotation, refined.translation), &truth, 1e-7);
    }

    #[test]
    fn noisy_points_stay_close() {
        let obj = cube_points();
        let truth = ground_truth();
        let mut img = project_all(&obj, &camera(), &truth);
        let offsets = [0.3, -0.2, 0.1, 0.4, -0.3, 0.2, -0.1, 0.25];
        for (p, o) in img.iter_mut().zip(offsets) {
            p.x += o;
            p.y -= o * 0.5;
        }
        let pose = &solve_pnp(&obj, &img, &camera(), PnpMethod::Iterative).unwrap()[0];
        assert!(pose.error().unwrap() < 0.5);
        assert!((pose.translation() - truth.translation()).norm() < 0.01);
    }

    #[test]
    fn general_points_need_six() {
        let obj = cube_points();
        let img = project_all(&obj, &camera(), &ground_truth());
        assert!(matches!(
            solve_pnp(&obj[..5], &img[..5], &camera(), PnpMethod::Iterative),
            Err(EstimationError::InsufficientPoints { required: 6, actual: 5, .. })
        ));
        assert!(matches!(
            solve_pnp(&obj[..3], &img[..3], &camera(), PnpMethod::Iterative),
            Err(EstimationError::InsufficientPoints { required: 4, actual: 3, .. })
        ));
    }
}
