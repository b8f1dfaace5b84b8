//! Lambda Twist P3P solver (Persson & Nordberg, ECCV 2018).
//!
//! Solves for the depths λᵢ along the three bearing vectors such that
//! `λᵢ yᵢ = R xᵢ + t`, then recovers `(R, t)` from the depth triplets.
//! Only the first three correspondences enter the solver; any further
//! points are left to the caller's error ranking.

use nalgebra::{Matrix3, Point2, Point3, SymmetricEigen, Vector3};

use super::Solution;
use crate::error::EstimationError;
use crate::euclidean::nearest_rotation;
use crate::pnp::PnpMethod;

/// Smallest accepted `|f₁ · (f₂ × f₃)|` over the unit bearings.
const MIN_BEARING_VOLUME: f64 = 1e-12;

pub(crate) fn solve(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Vec<Solution>, EstimationError> {
    if object_points.len() < 3 {
        return Err(EstimationError::InsufficientPoints {
            method: PnpMethod::Ap3p,
            required: 3,
            actual: object_points.len(),
        });
    }
    let world = [object_points[0], object_points[1], object_points[2]].map(|p| p.coords);
    let bearings = [normalized[0], normalized[1], normalized[2]]
        .map(|m| Vector3::new(m.x, m.y, 1.0).normalize());

    let d12 = world[0] - world[1];
    let d13 = world[0] - world[2];
    let d12xd13 = d12.cross(&d13);
    let scale = d12.norm_squared().max(d13.norm_squared());
    if d12xd13.norm_squared() <= 1e-20 * scale * scale {
        return Err(EstimationError::Collinear);
    }
    // Bearings in a common plane through the camera center see the
    // triangle edge-on; coincident bearings are the extreme case.
    if bearings[0].dot(&bearings[1].cross(&bearings[2])).abs() <= MIN_BEARING_VOLUME {
        return Err(EstimationError::Degenerate("image bearings are coplanar"));
    }

    let solutions: Vec<Solution> = lambda_twist(&world, &bearings)
        .into_iter()
        .filter(|s| s.translation.iter().all(|v| v.is_finite()))
        .collect();
    if solutions.is_empty() {
        return Err(EstimationError::NoSolution);
    }
    Ok(solutions)
}

/// Squared side lengths and bearing cosines shared by the refinement.
struct Triangle {
    a12: f64,
    a13: f64,
    a23: f64,
    b12: f64,
    b13: f64,
    b23: f64,
}

impl Triangle {
    fn residual(&self, l: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            l.x * l.x + l.y * l.y + self.b12 * l.x * l.y - self.a12,
            l.x * l.x + l.z * l.z + self.b13 * l.x * l.z - self.a13,
            l.y * l.y + l.z * l.z + self.b23 * l.y * l.z - self.a23,
        )
    }

    /// A few Gauss-Newton steps on the depth equations. Stops as soon as a
    /// step fails to reduce the residual.
    #[allow(clippy::similar_names)]
    fn refine(&self, lambda: Vector3<f64>) -> Vector3<f64> {
        let mut l = lambda;
        let mut res = self.residual(&l);
        for _ in 0..5 {
            if res.lp_norm(1) < 1e-14 {
                break;
            }
            let dr1dl1 = 2.0 * l.x + self.b12 * l.y;
            let dr1dl2 = 2.0 * l.y + self.b12 * l.x;
            let dr2dl1 = 2.0 * l.x + self.b13 * l.z;
            let dr2dl3 = 2.0 * l.z + self.b13 * l.x;
            let dr3dl2 = 2.0 * l.y + self.b23 * l.z;
            let dr3dl3 = 2.0 * l.z + self.b23 * l.y;
            let det = 1.0 / (-dr1dl1 * dr2dl3 * dr3dl2 - dr1dl2 * dr2dl1 * dr3dl3);
            if !det.is_finite() {
                break;
            }

            #[rustfmt::skip]
            let adjugate = Matrix3::new(
                -dr2dl3 * dr3dl2, -dr1dl2 * dr3dl3,  dr1dl2 * dr2dl3,
                -dr2dl1 * dr3dl3,  dr1dl1 * dr3dl3, -dr1dl1 * dr2dl3,
                 dr2dl1 * dr3dl2, -dr1dl1 * dr3dl2, -dr1dl2 * dr2dl1,
            );
            let next = l - det * (adjugate * res);
            let next_res = self.residual(&next);
            if next_res.lp_norm(1) > res.lp_norm(1) {
                break;
            }
            l = next;
            res = next_res;
        }
        l
    }
}

#[allow(clippy::similar_names)]
fn lambda_twist(world: &[Vector3<f64>; 3], f: &[Vector3<f64>; 3]) -> Vec<Solution> {
    let d12 = world[0] - world[1];
    let d13 = world[0] - world[2];
    let d23 = world[1] - world[2];

    let a12 = d12.norm_squared();
    let a13 = d13.norm_squared();
    let a23 = d23.norm_squared();

    let c12 = f[0].dot(&f[1]);
    let c23 = f[1].dot(&f[2]);
    let c31 = f[2].dot(&f[0]);
    let blob = c12 * c23 * c31 - 1.0;

    let s12_sqr = 1.0 - c12 * c12;
    let s23_sqr = 1.0 - c23 * c23;
    let s31_sqr = 1.0 - c31 * c31;

    let tri = Triangle {
        a12,
        a13,
        a23,
        b12: -2.0 * c12,
        b13: -2.0 * c31,
        b23: -2.0 * c23,
    };

    // Cubic whose root γ makes D1 + γ D2 singular.
    let p3 = a13 * (a23 * s31_sqr - a13 * s23_sqr);
    let p2 =
        2.0 * blob * a23 * a13 + a13 * (2.0 * a12 + a13) * s23_sqr + a23 * (a23 - a12) * s31_sqr;
    let p1 = a23 * (a13 - a23) * s12_sqr
        - a12 * a12 * s23_sqr
        - 2.0 * a12 * (blob * a23 + a13 * s23_sqr);
    let p0 = a12 * (a12 * s23_sqr - a23 * s12_sqr);
    if p3.abs() <= f64::EPSILON * (p0.abs() + p1.abs() + p2.abs()) {
        return Vec::new();
    }
    let g = cube_root(p2 / p3, p1 / p3, p0 / p3);

    #[rustfmt::skip]
    let d0 = Matrix3::new(
        a23 * (1.0 - g),  -(a23 * c12),              a23 * c31 * g,
        -(a23 * c12),     a23 - a12 + a13 * g,       -c23 * (a13 * g - a12),
        a23 * c31 * g,    -c23 * (a13 * g - a12),    g * (a13 - a23) - a12,
    );

    // D0 is singular; keep the two eigenpairs with the largest magnitude.
    let eigen = SymmetricEigen::new(d0);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        let (ea, eb) = (eigen.eigenvalues[a].abs(), eigen.eigenvalues[b].abs());
        eb.total_cmp(&ea)
    });
    let (e1, e2) = (eigen.eigenvalues[order[0]], eigen.eigenvalues[order[1]]);
    let v1 = eigen.eigenvectors.column(order[0]).into_owned();
    let v2 = eigen.eigenvectors.column(order[1]).into_owned();
    if e1 == 0.0 {
        return Vec::new();
    }
    let ratio = (-e2 / e1).max(0.0).sqrt();

    let mut lambdas = Vec::with_capacity(4);
    for s in [ratio, -ratio] {
        let w2 = 1.0 / (s * v2[0] - v1[0]);
        let w0 = w2 * (v1[1] - s * v2[1]);
        let w1 = w2 * (v1[2] - s * v2[2]);

        let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * tri.b13 * w1 - a12);
        let b = a * (a13 * tri.b12 * w1 - a12 * tri.b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
        let c = a * ((a13 - a12) * w0 * w0 + a13 * tri.b12 * w0 + a13);
        let Some((tau1, tau2)) = real_quadratic_roots(b, c) else {
            continue;
        };
        for tau in [tau1, tau2] {
            if tau <= 0.0 {
                continue;
            }
            let d = a23 / (tau * (tri.b23 + tau) + 1.0);
            if d <= 0.0 {
                continue;
            }
            let l2 = d.sqrt();
            let l3 = tau * l2;
            let l1 = w0 * l2 + w1 * l3;
            if l1 >= 0.0 {
                lambdas.push(Vector3::new(l1, l2, l3));
            }
        }
    }

    // R X = Y, with the columns of X spanning the object triangle.
    let d12xd13 = d12.cross(&d13);
    let Some(x_inv) = Matrix3::from_columns(&[d12, d13, d12xd13]).try_inverse() else {
        return Vec::new();
    };

    lambdas
        .into_iter()
        .filter_map(|lambda| {
            let l = tri.refine(lambda);
            if !l.iter().all(|d| d.is_finite() && *d > 0.0) {
                return None;
            }
            let ry1 = l[0] * f[0];
            let ry2 = l[1] * f[1];
            let ry3 = l[2] * f[2];
            let yd1 = ry1 - ry2;
            let yd2 = ry1 - ry3;
            let y = Matrix3::from_columns(&[yd1, yd2, yd1.cross(&yd2)]);
            let rotation = nearest_rotation(&(y * x_inv));
            Some(Solution {
                rotation,
                translation: ry1 - rotation * world[0],
            })
        })
        .collect()
}

/// Real roots of `r² + b r + c = 0`, computed without cancellation.
fn real_quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let y = discriminant.sqrt();
    if b < 0.0 {
        Some((0.5 * (-b + y), 0.5 * (-b - y)))
    } else {
        Some((2.0 * c / (-b + y), 2.0 * c / (-b - y)))
    }
}

/// One real root of `r³ + b r² + c r + d = 0` with as large a derivative as
/// possible, by Newton-Raphson from a carefully chosen start.
#[allow(clippy::many_single_char_names)]
fn cube_root(b: f64, c: f64, d: f64) -> f64 {
    let mut r0;
    if b * b >= 3.0 * c {
        // Two stationary points t1 < t2: start from the outer root of the
        // local quadratic model.
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k = ((t1 + b) * t1 + c) * t1 + d;
        if k > 0.0 {
            r0 = t1 - (-k / (3.0 * t1 + b)).sqrt();
        } else {
            let t2 = (-b + v) / 3.0;
            let k = ((t2 + b) * t2 + c) * t2 + d;
            r0 = t2 + (-k / (3.0 * t2 + b)).sqrt();
        }
    } else {
        r0 = -b / 3.0;
        if ((3.0 * r0 + 2.0 * b) * r0 + c).abs() < 1e-4 {
            r0 += 1.0;
        }
    }

    for i in 0..50 {
        let fx = ((r0 + b) * r0 + c) * r0 + d;
        if i >= 7 && fx.abs() <= 1e-13 {
            break;
        }
        let fpx = (3.0 * r0 + 2.0 * b) * r0 + c;
        if fpx == 0.0 {
            break;
        }
        r0 -= fx / fpx;
    }
    r0
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{solve_pnp, sort_by_error};
    use super::*;
    use crate::euclidean::Transform;
    use approx::assert_relative_eq;

    #[test]
    fn cubic_root_is_a_root() {
        // (r - 1)(r - 2)(r + 3) = r³ - 7r + 6
        let r = cube_root(0.0, -7.0, 6.0);
        assert_relative_eq!(((r * r) - 7.0) * r + 6.0, 0.0, epsilon = 1e-10);
        // single real root: r³ + r + 1
        let r = cube_root(0.0, 1.0, 1.0);
        assert_relative_eq!((r * r + 1.0) * r + 1.0, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn quadratic_roots() {
        let (r1, r2) = real_quadratic_roots(-3.0, 2.0).unwrap();
        assert_relative_eq!(r1.max(r2), 2.0);
        assert_relative_eq!(r1.min(r2), 1.0);
        assert!(real_quadratic_roots(0.0, 1.0).is_none());
    }

    #[test]
    fn three_points_include_ground_truth() {
        let obj = cube_points()[..3].to_vec();
        let truth = ground_truth();
        let img = project_all(&obj, &camera(), &truth);
        let candidates = solve_pnp(&obj, &img, &camera(), PnpMethod::Ap3p).unwrap();
        assert!(!candidates.is_empty() && candidates.len() <= 4);
        assert!(
            candidates.iter().any(|c| c.angle_to(&truth) < 1e-8
                && (c.translation() - truth.translation()).norm() < 1e-8),
            "{candidates:?}"
        );
    }

    #[test]
    fn extra_points_rank_candidates() {
        let obj = cube_points();
        let truth = Transform::from_rotation_vector(
            Vector3::new(-0.3, 0.2, 0.05),
            Vector3::new(-0.1, 0.2, 2.0),
        );
        let img = project_all(&obj, &camera(), &truth);
        let mut candidates = solve_pnp(&obj, &img, &camera(), PnpMethod::Ap3p).unwrap();
        sort_by_error(&mut candidates);
        assert!(candidates[0].error().unwrap() < 1e-6);
        assert_pose_close(&candidates[0], &truth, 1e-8);
    }

    #[test]
    fn rejects_degenerate_bearings() {
        let obj = cube_points()[..3].to_vec();
        let same = vec![Point2::new(0.01, -0.02); 3];
        assert!(matches!(solve(&obj, &same), Err(EstimationError::Degenerate(_))));
        let on_a_line = vec![
            Point2::new(0.0, 0.0),
            Point2::new(0.1, 0.05),
            Point2::new(-0.2, -0.1),
        ];
        assert!(matches!(solve(&obj, &on_a_line), Err(EstimationError::Degenerate(_))));

        let tag = crate::field::tag_corners(0.2);
        let center = vec![Point2::new(320.0, 240.0); 4];
        let camera = crate::camera::LOGITECH_C920;
        assert!(solve_pnp(&tag, &center, &camera, PnpMethod::Ap3p).is_err());
    }

    #[test]
    fn rejects_collinear_and_too_few() {
        let line: Vec<_> = (0..3)
            .map(|i| Point3::new(0.1 * i as f64, 0.05 * i as f64, 0.0))
            .collect();
        let img = vec![Point2::new(0.0, 0.0), Point2::new(0.1, 0.0), Point2::new(0.0, 0.1)];
        assert_eq!(solve(&line, &img).unwrap_err(), EstimationError::Collinear);
        assert!(matches!(
            solve(&line[..2], &img[..2]),
            Err(EstimationError::InsufficientPoints { required: 3, actual: 2, .. })
        ));
    }
}
