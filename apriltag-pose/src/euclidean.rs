use nalgebra::{
    Isometry3, Matrix3, Matrix4, Point3, Quaternion, Rotation3, SymmetricEigen, Translation3,
    UnitQuaternion, Vector3, Vector4,
};

use crate::error::{FrameMismatchError, TransformError};

/// Maximum deviation of `RᵀR` from identity accepted for a rotation matrix.
const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// A rigid 3D transform, optionally tagged with the frames it maps between.
///
/// The transform maps points from `input_frame` into `output_frame`. Poses
/// produced by a PnP solver also carry their reprojection error, and the
/// best candidate of an ambiguous observation carries the ambiguity ratio.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "TransformRepr", into = "TransformRepr")
)]
pub struct Transform {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
    input_frame: Option<String>,
    output_frame: Option<String>,
    error: Option<f64>,
    ambiguity: Option<f64>,
}

impl Transform {
    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
            input_frame: None,
            output_frame: None,
            error: None,
            ambiguity: None,
        }
    }

    /// Build a transform from a raw rotation matrix, checking orthonormality.
    pub fn from_rotation_matrix(
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Result<Self, TransformError> {
        if !rotation.iter().all(|v| v.is_finite()) || !translation.iter().all(|v| v.is_finite()) {
            return Err(TransformError::NotRigid("non-finite entries"));
        }
        let gram = rotation.transpose() * rotation - Matrix3::identity();
        if gram.amax() > ORTHONORMAL_TOLERANCE {
            return Err(TransformError::NotRigid("rotation is not orthonormal"));
        }
        if rotation.determinant() <= 0.0 {
            return Err(TransformError::NotRigid("rotation is a reflection"));
        }
        Ok(Self::new(Rotation3::from_matrix_unchecked(rotation), translation))
    }

    /// Build a transform from an axis-angle rotation vector (radians).
    pub fn from_rotation_vector(rotation_vector: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(Rotation3::new(rotation_vector), translation)
    }

    /// The identity transform, with both frames set to `frame`.
    pub fn identity(frame: Option<&str>) -> Self {
        let mut identity = Self::new(Rotation3::identity(), Vector3::zeros());
        identity.input_frame = frame.map(str::to_owned);
        identity.output_frame = frame.map(str::to_owned);
        identity
    }

    /// Parse a 4x4 homogeneous matrix.
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Result<Self, TransformError> {
        let bottom = matrix.fixed_view::<1, 4>(3, 0);
        let expected = [0.0, 0.0, 0.0, 1.0];
        if bottom.iter().zip(expected).any(|(a, b)| (a - b).abs() > 1e-9) {
            return Err(TransformError::NotRigid("bottom row is not [0, 0, 0, 1]"));
        }
        let rotation: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let translation: Vector3<f64> = matrix.fixed_view::<3, 1>(0, 3).into_owned();
        Self::from_rotation_matrix(rotation, translation)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(self.rotation.matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_rotation_matrix(&self.rotation),
        )
    }

    pub fn with_frames(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input_frame = Some(input.into());
        self.output_frame = Some(output.into());
        self
    }

    pub fn with_error(mut self, error: f64) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_ambiguity(mut self, ambiguity: f64) -> Self {
        self.ambiguity = Some(ambiguity);
        self
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn rotation_matrix(&self) -> &Matrix3<f64> {
        self.rotation.matrix()
    }

    /// Axis-angle form of the rotation (radians).
    pub fn rotation_vector(&self) -> Vector3<f64> {
        rotation_vector(&self.rotation)
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn input_frame(&self) -> Option<&str> {
        self.input_frame.as_deref()
    }

    pub fn output_frame(&self) -> Option<&str> {
        self.output_frame.as_deref()
    }

    /// Reprojection RMSE in pixels, for solver-produced poses.
    pub fn error(&self) -> Option<f64> {
        self.error
    }

    /// Best-to-second-best error ratio among sibling candidates.
    pub fn ambiguity(&self) -> Option<f64> {
        self.ambiguity
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    ///
    /// Frames are only checked when both sides carry them. The result maps
    /// `other.input_frame` to `self.output_frame` and has no error or ambiguity.
    pub fn compose(&self, other: &Transform) -> Result<Transform, FrameMismatchError> {
        if let (Some(expected), Some(found)) = (&self.input_frame, &other.output_frame) {
            if expected != found {
                return Err(FrameMismatchError {
                    expected: expected.clone(),
                    found: found.clone(),
                });
            }
        }
        Ok(Transform {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
            input_frame: other.input_frame.clone(),
            output_frame: self.output_frame.clone(),
            error: None,
            ambiguity: None,
        })
    }

    /// The inverse transform, with frames swapped.
    pub fn inverse(&self) -> Transform {
        let rotation = self.rotation.inverse();
        Transform {
            translation: -(rotation * self.translation),
            rotation,
            input_frame: self.output_frame.clone(),
            output_frame: self.input_frame.clone(),
            error: self.error,
            ambiguity: self.ambiguity,
        }
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    pub fn transform_points(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points.iter().map(|p| self.transform_point(p)).collect()
    }

    /// Magnitude (radians) of the rotation taking `other` onto `self`.
    pub fn angle_to(&self, other: &Transform) -> f64 {
        rotation_distance(&self.rotation, &other.rotation)
    }

    /// Weighted average of several transforms.
    ///
    /// Translations are averaged linearly. Rotations use the quaternion
    /// average: the dominant eigenvector of `Σ wᵢ qᵢ qᵢᵀ`, which is
    /// insensitive to the sign ambiguity of each quaternion. Returns `None`
    /// for an empty input or a non-positive total weight.
    pub fn weighted_mean(items: &[(Transform, f64)]) -> Option<Transform> {
        let total: f64 = items.iter().map(|(_, w)| *w).sum();
        if items.is_empty() || !total.is_finite() || total <= 0.0 {
            return None;
        }

        let mut translation = Vector3::zeros();
        let mut accum = nalgebra::Matrix4::<f64>::zeros();
        for (transform, weight) in items {
            translation += transform.translation * *weight;
            let q: Vector4<f64> = UnitQuaternion::from_rotation_matrix(&transform.rotation)
                .into_inner()
                .coords;
            accum += q * q.transpose() * *weight;
        }
        translation /= total;

        let eigen = SymmetricEigen::new(accum);
        let (dominant, _) = eigen
            .eigenvalues
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        let q = eigen.eigenvectors.column(dominant).into_owned();
        let rotation =
            UnitQuaternion::new_normalize(Quaternion::from_vector(q)).to_rotation_matrix();

        Some(Transform::new(rotation, translation))
    }
}

/// Angle (radians) of `a · bᵀ`, in `[0, π]`.
///
/// Goes through the quaternion, whose angle is an `atan2` and stays finite
/// when the trace of a nearly identical pair rounds past 3.
pub fn rotation_distance(a: &Rotation3<f64>, b: &Rotation3<f64>) -> f64 {
    UnitQuaternion::from_rotation_matrix(&(a * b.inverse())).angle()
}

/// Axis-angle vector of `r`, finite for rotations arbitrarily close to
/// the identity.
pub fn rotation_vector(r: &Rotation3<f64>) -> Vector3<f64> {
    UnitQuaternion::from_rotation_matrix(r).scaled_axis()
}

/// Closest rotation to `m` in the Frobenius norm.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Rotation3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Rotation3::identity();
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        // Negate third column of U and recompute
        let mut u_fixed = u;
        for i in 0..3 {
            u_fixed[(i, 2)] = -u_fixed[(i, 2)];
        }
        r = u_fixed * v_t;
    }
    Rotation3::from_matrix_unchecked(r)
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct TransformRepr {
    /// Row-major 3x3 rotation.
    rotation: [[f64; 3]; 3],
    translation: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ambiguity: Option<f64>,
}

#[cfg(feature = "serde")]
impl From<Transform> for TransformRepr {
    fn from(t: Transform) -> Self {
        let r = t.rotation.matrix();
        TransformRepr {
            rotation: [
                [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
                [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
                [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
            ],
            translation: [t.translation.x, t.translation.y, t.translation.z],
            input_frame: t.input_frame,
            output_frame: t.output_frame,
            error: t.error,
            ambiguity: t.ambiguity,
        }
    }
}

#[cfg(feature = "serde")]
impl TryFrom<TransformRepr> for Transform {
    type Error = TransformError;

    fn try_from(repr: TransformRepr) -> Result<Self, Self::Error> {
        let r = repr.rotation;
        let rotation = Matrix3::new(
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        );
        let mut t = Transform::from_rotation_matrix(rotation, Vector3::from(repr.translation))?;
        t.input_frame = repr.input_frame;
        t.output_frame = repr.output_frame;
        t.error = repr.error;
        t.ambiguity = repr.ambiguity;
        Ok(t)
    }
}
