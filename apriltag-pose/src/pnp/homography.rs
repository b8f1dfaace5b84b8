use nalgebra::{Matrix3, Point2, SMatrix, SymmetricEigen, Vector3};

/// A 3x3 planar homography.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    pub data: Matrix3<f64>,
}

impl Homography {
    /// Estimate the homography mapping `src` onto `dst` (normalized DLT).
    ///
    /// Needs at least 4 correspondences with no three collinear. Returns
    /// `None` for degenerate input. The result is scaled so that `h[2][2] = 1`
    /// whenever that entry is non-zero.
    pub fn from_correspondences(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Self> {
        if src.len() != dst.len() || src.len() < 4 {
            return None;
        }
        let t_src = normalizing_transform(src)?;
        let t_dst = normalizing_transform(dst)?;

        // Accumulate AᵀA directly; A has two rows per correspondence.
        let mut ata = SMatrix::<f64, 9, 9>::zeros();
        for (s, d) in src.iter().zip(dst) {
            let s = t_src * Vector3::new(s.x, s.y, 1.0);
            let d = t_dst * Vector3::new(d.x, d.y, 1.0);
            let (x, y) = (s.x / s.z, s.y / s.z);
            let (u, v) = (d.x / d.z, d.y / d.z);

            let row0 = SMatrix::<f64, 1, 9>::from_row_slice(&[
                -x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u,
            ]);
            let row1 = SMatrix::<f64, 1, 9>::from_row_slice(&[
                0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v,
            ]);
            ata += row0.transpose() * row0 + row1.transpose() * row1;
        }

        let eigen = SymmetricEigen::new(ata);
        let mut order: Vec<usize> = (0..9).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        let largest = eigen.eigenvalues[order[8]];
        // A second (near-)null direction means the points do not pin down H.
        if largest <= 0.0 || eigen.eigenvalues[order[1]] < 1e-12 * largest {
            return None;
        }

        let h = eigen.eigenvectors.column(order[0]);
        let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
        let t_dst_inv = t_dst.try_inverse()?;
        let data = t_dst_inv * h_norm * t_src;
        Some(Homography { data }.normalized())
    }

    /// Rescale so that `h[2][2] = 1` (left unchanged if that entry is ~0).
    pub fn normalized(&self) -> Self {
        let h22 = self.data[(2, 2)];
        if h22.abs() < 1e-12 {
            return *self;
        }
        Homography {
            data: self.data / h22,
        }
    }

    /// Map a point through the homography.
    pub fn project(&self, p: &Point2<f64>) -> Point2<f64> {
        let q = self.data * Vector3::new(p.x, p.y, 1.0);
        Point2::new(q.x / q.z, q.y / q.z)
    }

    /// Compute the inverse homography.
    pub fn inverse(&self) -> Option<Self> {
        if self.data.determinant().abs() < 1e-10 {
            return None;
        }
        self.data.try_inverse().map(|data| Homography { data })
    }
}

/// Hartley normalization: centroid to the origin, mean distance √2.
fn normalizing_transform(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(ax, ay), p| (ax + p.x, ay + p.y));
    let (mx, my) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        s, 0.0, -s * mx, //
        0.0, s, -s * my, //
        0.0, 0.0, 1.0,
    ))
}
