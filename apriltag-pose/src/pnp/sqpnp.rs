//! SQPnP (Terzakis & Lourakis, ECCV 2020).
//!
//! Eliminates the translation to get a quadratic form `rᵀ Ω r` over the
//! row-major entries of R, then runs sequential quadratic programming on
//! the orthogonality constraints from each (near-)null eigenvector of Ω.
//! Returns the single candidate with the lowest cost.

use log::trace;
use nalgebra::{Matrix3, Point2, Point3, Rotation3, SMatrix, SVector, SymmetricEigen, Vector3};

use super::Solution;
use crate::error::EstimationError;
use crate::euclidean::nearest_rotation;
use crate::pnp::PnpMethod;

type Vector9 = SVector<f64, 9>;
type Matrix9 = SMatrix<f64, 9, 9>;
type Matrix39 = SMatrix<f64, 3, 9>;

const RANK_TOLERANCE: f64 = 1e-7;
const SQP_SQUARED_TOLERANCE: f64 = 1e-16;
const SQP_MAX_ITERATIONS: usize = 15;
const ORTHOGONALITY_SQUARED_ERROR_THRESHOLD: f64 = 1e-8;

pub(crate) fn solve(
    object_points: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<Vec<Solution>, EstimationError> {
    let n = object_points.len();
    if n < 3 {
        return Err(EstimationError::InsufficientPoints {
            method: PnpMethod::Sqpnp,
            required: 3,
            actual: n,
        });
    }
    let problem = Problem::new(object_points, normalized)?;
    let best = problem.search().ok_or(EstimationError::NoSolution)?;
    Ok(vec![best])
}

struct Problem<'a> {
    object_points: &'a [Point3<f64>],
    omega: Matrix9,
    /// Maps r to the optimal translation, `t = P r`.
    p: Matrix39,
    mean: Point3<f64>,
}

struct Candidate {
    r: Vector9,
    t: Vector3<f64>,
    sq_error: f64,
}

impl<'a> Problem<'a> {
    fn new(
        object_points: &'a [Point3<f64>],
        normalized: &[Point2<f64>],
    ) -> Result<Self, EstimationError> {
        let mut omega = Matrix9::zeros();
        let mut q_sum = Matrix3::zeros();
        let mut qa_sum = Matrix39::zeros();
        let mut mean = Vector3::zeros();

        for (point, m) in object_points.iter().zip(normalized) {
            let (x, y) = (m.x, m.y);
            let q = Matrix3::new(1.0, 0.0, -x, 0.0, 1.0, -y, -x, -y, x * x + y * y);
            let mut a = Matrix39::zeros();
            for row in 0..3 {
                for col in 0..3 {
                    a[(row, 3 * row + col)] = point[col];
                }
            }
            let qa = q * a;
            omega += a.transpose() * qa;
            q_sum += q;
            qa_sum += qa;
            mean += point.coords;
        }

        let q_inv = q_sum
            .try_inverse()
            .ok_or(EstimationError::Degenerate("image points coincide"))?;
        let p = -(q_inv * qa_sum);
        omega += qa_sum.transpose() * p;
        omega = 0.5 * (omega + omega.transpose());

        Ok(Problem {
            object_points,
            omega,
            p,
            mean: Point3::from(mean / object_points.len() as f64),
        })
    }

    fn search(&self) -> Option<Solution> {
        let eigen = SymmetricEigen::new(self.omega);
        let mut order: [usize; 9] = std::array::from_fn(|i| i);
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        let values: [f64; 9] = order.map(|i| eigen.eigenvalues[i]);
        let vectors: [Vector9; 9] = order.map(|i| eigen.eigenvectors.column(i).into_owned());

        let null_dimension = values.iter().take_while(|&&v| v < RANK_TOLERANCE).count();
        if null_dimension > 6 {
            trace!("sqpnp: null space of dimension {null_dimension}");
            return None;
        }
        let null_dimension = null_dimension.max(1);

        let mut best: Option<Candidate> = None;

        for e in &vectors[..null_dimension] {
            let e = e * 3f64.sqrt();
            if orthogonality_error(&e) < ORTHOGONALITY_SQUARED_ERROR_THRESHOLD {
                let sign = to_matrix(&e).determinant().signum();
                let r = to_vector(nearest_rotation(&to_matrix(&(sign * e))).matrix());
                keep_best(&mut best, self.candidate(r));
            } else {
                keep_best(&mut best, self.run_from(&e));
                keep_best(&mut best, self.run_from(&-e));
            }
        }

        // Vectors just outside the null space can still lead to the minimum
        // when the data is noisy.
        let mut index = null_dimension;
        while index < 8 {
            let min_error = best.as_ref().map_or(f64::INFINITY, |b| b.sq_error);
            if min_error <= 3.0 * values[index] {
                break;
            }
            keep_best(&mut best, self.run_from(&vectors[index]));
            keep_best(&mut best, self.run_from(&-vectors[index]));
            index += 1;
        }

        let best = best?;
        trace!("sqpnp: null space {null_dimension}, cost {:e}", best.sq_error);
        Some(Solution {
            rotation: Rotation3::from_matrix_unchecked(to_matrix(&best.r)),
            translation: best.t,
        })
    }

    fn run_from(&self, e: &Vector9) -> Option<Candidate> {
        let start = to_vector(nearest_rotation(&to_matrix(e)).matrix());
        let r = self.sqp(start);
        self.candidate(r)
    }

    fn sqp(&self, mut r: Vector9) -> Vector9 {
        for _ in 0..SQP_MAX_ITERATIONS {
            let Some(delta) = self.sqp_step(&r) else {
                break;
            };
            r += delta;
            if delta.norm_squared() < SQP_SQUARED_TOLERANCE {
                break;
            }
        }
        to_vector(nearest_rotation(&to_matrix(&r)).matrix())
    }

    /// One Newton step on the KKT system of
    /// `min (r + δ)ᵀ Ω (r + δ)` subject to the linearized `h(r) + J δ = 0`.
    fn sqp_step(&self, r: &Vector9) -> Option<Vector9> {
        let (h, jacobian) = constraints(r);
        let mut kkt = SMatrix::<f64, 15, 15>::zeros();
        kkt.fixed_view_mut::<9, 9>(0, 0).copy_from(&self.omega);
        kkt.fixed_view_mut::<9, 6>(0, 9).copy_from(&jacobian.transpose());
        kkt.fixed_view_mut::<6, 9>(9, 0).copy_from(&jacobian);

        let mut rhs = SVector::<f64, 15>::zeros();
        rhs.fixed_rows_mut::<9>(0).copy_from(&-(self.omega * r));
        rhs.fixed_rows_mut::<6>(9).copy_from(&-h);

        let solution = kkt.lu().solve(&rhs)?;
        let delta: Vector9 = solution.fixed_rows::<9>(0).into_owned();
        delta.iter().all(|v| v.is_finite()).then_some(delta)
    }

    /// Score a rotation; `None` if it puts the points behind the camera.
    fn candidate(&self, r: Vector9) -> Option<Candidate> {
        let t = self.p * r;
        let rotation = to_matrix(&r);
        let in_front = |p: &Point3<f64>| (rotation * p.coords + t).z > 0.0;
        let visible = self.object_points.iter().filter(|p| in_front(*p)).count();
        let majority = visible * 2 > self.object_points.len();
        if !in_front(&self.mean) && !majority {
            return None;
        }
        let sq_error = r.dot(&(self.omega * r));
        Some(Candidate { r, t, sq_error })
    }
}

fn keep_best(best: &mut Option<Candidate>, candidate: Option<Candidate>) {
    if let Some(c) = candidate {
        if best.as_ref().map_or(true, |b| c.sq_error < b.sq_error) {
            *best = Some(c);
        }
    }
}

/// Row-major 3x3 view of a 9-vector.
fn to_matrix(r: &Vector9) -> Matrix3<f64> {
    Matrix3::new(r[0], r[1], r[2], r[3], r[4], r[5], r[6], r[7], r[8])
}

fn to_vector(m: &Matrix3<f64>) -> Vector9 {
    Vector9::from_fn(|i, _| m[(i / 3, i % 3)])
}

/// `‖R Rᵀ - I‖²_F` for the matrix held in `r`.
fn orthogonality_error(r: &Vector9) -> f64 {
    let m = to_matrix(r);
    (m * m.transpose() - Matrix3::identity()).norm_squared()
}

/// Row norms and pairwise row products of R, with their Jacobian.
fn constraints(r: &Vector9) -> (SVector<f64, 6>, SMatrix<f64, 6, 9>) {
    let row = |i: usize| Vector3::new(r[3 * i], r[3 * i + 1], r[3 * i + 2]);
    let (r1, r2, r3) = (row(0), row(1), row(2));

    let h = SVector::<f64, 6>::from_column_slice(&[
        r1.norm_squared() - 1.0,
        r2.norm_squared() - 1.0,
        r3.norm_squared() - 1.0,
        r1.dot(&r2),
        r1.dot(&r3),
        r2.dot(&r3),
    ]);

    let mut j = SMatrix::<f64, 6, 9>::zeros();
    let mut put = |constraint: usize, block: usize, v: Vector3<f64>| {
        for k in 0..3 {
            j[(constraint, 3 * block + k)] = v[k];
        }
    };
    put(0, 0, 2.0 * r1);
    put(1, 1, 2.0 * r2);
    put(2, 2, 2.0 * r3);
    put(3, 0, r2);
    put(3, 1, r1);
    put(4, 0, r3);
    put(4, 2, r1);
    put(5, 1, r3);
    put(5, 2, r2);
    (h, j)
}
