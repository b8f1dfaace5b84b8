use std::collections::BTreeMap;
use std::sync::OnceLock;

use nalgebra::Point3;

use crate::error::{ConfigurationError, FieldError};
use crate::euclidean::Transform;

pub const DEFAULT_TAG_FAMILY: &str = "tag36h11";

/// Tag corners in the tag's own frame, for a tag of edge length `tag_size`.
///
/// Order is (-s, +s), (+s, +s), (+s, -s), (-s, -s) with `s = tag_size / 2`,
/// the same winding the detector reports its 2D corners in.
pub fn tag_corners(tag_size: f64) -> [Point3<f64>; 4] {
    let s = tag_size / 2.0;
    [
        Point3::new(-s, s, 0.0),
        Point3::new(s, s, 0.0),
        Point3::new(s, -s, 0.0),
        Point3::new(-s, -s, 0.0),
    ]
}

#[derive(Debug, Clone)]
struct FieldTag {
    pose: Transform,
    corners: OnceLock<[Point3<f64>; 4]>,
}

/// Known placement of every tag in a world frame.
///
/// Immutable after construction. World-frame corners are computed the first
/// time a tag is queried and cached for the lifetime of the field; the cache
/// is safe to populate from several threads at once.
#[derive(Debug, Clone)]
pub struct AprilTagField {
    tag_size: f64,
    tag_family: String,
    frame: Option<String>,
    tags: BTreeMap<u32, FieldTag>,
}

impl AprilTagField {
    /// Build a field from tag poses (tag frame to world frame).
    pub fn new(
        tag_size: f64,
        tag_family: impl Into<String>,
        tags: impl IntoIterator<Item = (u32, Transform)>,
    ) -> Result<Self, FieldError> {
        if !tag_size.is_finite() || tag_size <= 0.0 {
            return Err(ConfigurationError::InvalidTagSize(tag_size).into());
        }
        let mut map = BTreeMap::new();
        for (id, pose) in tags {
            let entry = FieldTag {
                pose,
                corners: OnceLock::new(),
            };
            if map.insert(id, entry).is_some() {
                return Err(FieldError::DuplicateTag(id));
            }
        }
        Ok(Self {
            tag_size,
            tag_family: tag_family.into(),
            frame: None,
            tags: map,
        })
    }

    /// Name the world frame the tag poses are expressed in.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frame = Some(frame.into());
        self
    }

    pub fn tag_size(&self) -> f64 {
        self.tag_size
    }

    pub fn tag_family(&self) -> &str {
        &self.tag_family
    }

    pub fn frame(&self) -> Option<&str> {
        self.frame.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn contains(&self, tag_id: u32) -> bool {
        self.tags.contains_key(&tag_id)
    }

    /// Tag IDs in ascending order.
    pub fn tag_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.tags.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Transform)> + '_ {
        self.tags.iter().map(|(id, tag)| (*id, &tag.pose))
    }

    /// Pose of a tag in the world frame.
    pub fn get(&self, tag_id: u32) -> Result<&Transform, FieldError> {
        self.entry(tag_id).map(|tag| &tag.pose)
    }

    /// World-frame corners of one tag, in [`tag_corners`] order.
    pub fn corners(&self, tag_id: u32) -> Result<[Point3<f64>; 4], FieldError> {
        let tag = self.entry(tag_id)?;
        let corners = tag.corners.get_or_init(|| {
            let local = tag_corners(self.tag_size);
            local.map(|p| tag.pose.transform_point(&p))
        });
        Ok(*corners)
    }

    /// World-frame corners of several tags, stacked in the order given.
    pub fn get_corners(&self, tag_ids: &[u32]) -> Result<Vec<Point3<f64>>, FieldError> {
        let mut out = Vec::with_capacity(tag_ids.len() * 4);
        for &id in tag_ids {
            out.extend(self.corners(id)?);
        }
        Ok(out)
    }

    fn entry(&self, tag_id: u32) -> Result<&FieldTag, FieldError> {
        self.tags.get(&tag_id).ok_or(FieldError::UnknownTag(tag_id))
    }
}

#[cfg(feature = "serde")]
pub use description::{FiducialDescription, FieldDescription, TagAxes};

#[cfg(feature = "serde")]
mod description {
    use std::path::Path;

    use log::warn;
    use nalgebra::{Matrix3, Matrix4, Vector3};
    use serde::{Deserialize, Serialize};

    use super::{AprilTagField, DEFAULT_TAG_FAMILY};
    use crate::error::{FieldError, TransformError};
    use crate::euclidean::Transform;

    /// How fiducial poses in a description orient the tag.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum TagAxes {
        /// Poses map the tag frame of [`tag_corners`](super::tag_corners) directly.
        #[default]
        Native,
        /// WPILib / Limelight convention: x points out of the tag face and z up.
        Wpilib,
    }

    impl TagAxes {
        /// Rotation from the tag frame into the description's fiducial frame.
        fn to_fiducial(self) -> Matrix3<f64> {
            match self {
                TagAxes::Native => Matrix3::identity(),
                TagAxes::Wpilib => Matrix3::new(
                    0.0, 0.0, 1.0, //
                    -1.0, 0.0, 0.0, //
                    0.0, -1.0, 0.0,
                ),
            }
        }
    }

    /// Serialized field layout.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FieldDescription {
        /// Tag edge length in meters.
        pub tag_size: f64,
        #[serde(default = "default_family")]
        pub tag_family: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub frame: Option<String>,
        #[serde(default)]
        pub tag_axes: TagAxes,
        pub fiducials: Vec<FiducialDescription>,
    }

    /// One tag placement: either a row-major 4x4 `transform`, or a
    /// `rotation` + `translation` pair.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FiducialDescription {
        pub id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub transform: Option<[f64; 16]>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub rotation: Option<[[f64; 3]; 3]>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub translation: Option<[f64; 3]>,
    }

    fn default_family() -> String {
        DEFAULT_TAG_FAMILY.to_string()
    }

    impl FiducialDescription {
        fn pose(&self, axes: TagAxes) -> Result<Transform, TransformError> {
            let fiducial = match (&self.transform, &self.rotation, &self.translation) {
                (Some(m), None, None) => Transform::from_matrix(&Matrix4::from_row_slice(m))?,
                (None, Some(r), Some(t)) => {
                    let rotation = Matrix3::from_row_slice(&r.concat());
                    Transform::from_rotation_matrix(rotation, Vector3::from(*t))?
                }
                _ => {
                    return Err(TransformError::NotRigid(
                        "expected either `transform` or `rotation` with `translation`",
                    ))
                }
            };
            let axis_change =
                Transform::from_rotation_matrix(axes.to_fiducial(), Vector3::zeros())?;
            // Untagged operands, so composition cannot fail.
            fiducial
                .compose(&axis_change)
                .map_err(|_| TransformError::NotRigid("frame mismatch"))
        }
    }

    impl FieldDescription {
        pub fn into_field(self) -> Result<AprilTagField, FieldError> {
            if self.fiducials.is_empty() {
                warn!("field description has no fiducials");
            }
            let mut tags = Vec::with_capacity(self.fiducials.len());
            for fiducial in &self.fiducials {
                let pose = fiducial
                    .pose(self.tag_axes)
                    .map_err(|source| FieldError::Transform {
                        id: fiducial.id,
                        source,
                    })?;
                let pose = match &self.frame {
                    Some(frame) => pose.with_frames(format!("tag{}", fiducial.id), frame.clone()),
                    None => pose,
                };
                tags.push((fiducial.id, pose));
            }
            let field = AprilTagField::new(self.tag_size, self.tag_family, tags)?;
            Ok(match self.frame {
                Some(frame) => field.with_frame(frame),
                None => field,
            })
        }
    }

    impl AprilTagField {
        pub fn from_json_str(s: &str) -> Result<Self, FieldError> {
            let description: FieldDescription = serde_json::from_str(s)?;
            description.into_field()
        }

        pub fn from_toml_str(s: &str) -> Result<Self, FieldError> {
            let description: FieldDescription = toml::from_str(s)?;
            description.into_field()
        }

        /// Load a `.json` or `.toml` field description.
        pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FieldError> {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some(ext)
                    if ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("fmap") =>
                {
                    Self::from_json_str(&text)
                }
                Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::from_toml_str(&text),
                other => Err(FieldError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;
    use std::f64::consts::FRAC_PI_2;

    fn two_tag_field() -> AprilTagField {
        AprilTagField::new(
            0.2,
            "tag36h11",
            [
                (1, Transform::from_rotation_vector(Vector3::zeros(), Vector3::new(0.0, 0.0, 2.0))),
                (
                    2,
                    Transform::from_rotation_vector(
                        Vector3::new(0.0, FRAC_PI_2, 0.0),
                        Vector3::new(1.0, 0.0, 0.0),
                    ),
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn corner_order_in_tag_frame() {
        let c = tag_corners(2.0);
        assert_eq!(c[0], Point3::new(-1.0, 1.0, 0.0));
        assert_eq!(c[1], Point3::new(1.0, 1.0, 0.0));
        assert_eq!(c[2], Point3::new(1.0, -1.0, 0.0));
        assert_eq!(c[3], Point3::new(-1.0, -1.0, 0.0));
    }

    #[test]
    fn corners_follow_tag_pose() {
        let field = two_tag_field();
        let c = field.corners(1).unwrap();
        assert_abs_diff_eq!(c[0], Point3::new(-0.1, 0.1, 2.0), epsilon = 1e-12);

        // rotated 90° about y: tag x maps to world -z
        let c = field.corners(2).unwrap();
        assert_abs_diff_eq!(c[1], Point3::new(1.0, 0.1, -0.1), epsilon = 1e-12);
    }

    #[test]
    fn get_corners_stacks_in_requested_order() {
        let field = two_tag_field();
        let stacked = field.get_corners(&[2, 1]).unwrap();
        assert_eq!(stacked.len(), 8);
        assert_eq!(stacked[..4], field.corners(2).unwrap());
        assert_eq!(stacked[4..], field.corners(1).unwrap());
        assert!(field.get_corners(&[]).unwrap().is_empty());
    }

    #[test]
    fn unknown_tag_is_not_found() {
        let field = two_tag_field();
        assert!(matches!(field.get(9), Err(FieldError::UnknownTag(9))));
        assert!(matches!(field.get_corners(&[1, 9]), Err(FieldError::UnknownTag(9))));
        assert!(field.contains(1));
        assert_eq!(field.tag_ids().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn rejects_bad_construction() {
        let pose = Transform::identity(None);
        assert!(AprilTagField::new(0.0, "tag36h11", [(1, pose.clone())]).is_err());
        assert!(matches!(
            AprilTagField::new(0.1, "tag36h11", [(1, pose.clone()), (1, pose)]),
            Err(FieldError::DuplicateTag(1))
        ));
    }

    #[test]
    fn corner_cache_is_shared_across_threads() {
        let field = two_tag_field();
        let expected = field.clone().corners(2).unwrap();
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| field.corners(2).unwrap()))
                .collect();
            for h in handles {
                assert_eq!(h.join().unwrap(), expected);
            }
        });
    }

    #[test]
    #[cfg(feature = "serde")]
    fn load_json_with_matrix_transforms() {
        let json = r#"{
            "tag_size": 0.1651,
            "frame": "field",
            "fiducials": [
                { "id": 3, "transform": [1, 0, 0, 8.0,  0, 1, 0, 0.5,  0, 0, 1, 1.45,  0, 0, 0, 1] }
            ]
        }"#;
        let field = AprilTagField::from_json_str(json).unwrap();
        assert_eq!(field.tag_family(), DEFAULT_TAG_FAMILY);
        assert_eq!(field.frame(), Some("field"));
        let pose = field.get(3).unwrap();
        assert_eq!(pose.translation(), &Vector3::new(8.0, 0.5, 1.45));
        assert_eq!(pose.output_frame(), Some("field"));
    }

    #[test]
    #[cfg(feature = "serde")]
    fn load_toml_with_wpilib_axes() {
        let toml_str = r#"
            tag_size = 0.2
            tag_family = "tag16h5"
            tag_axes = "wpilib"

            [[fiducials]]
            id = 4
            rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
            translation = [5.0, 0.0, 1.0]
        "#;
        let field = AprilTagField::from_toml_str(toml_str).unwrap();
        assert_eq!(field.tag_family(), "tag16h5");
        // The tag normal (+z in the tag frame) points along the fiducial +x.
        let normal = field.get(4).unwrap().rotation() * Vector3::z();
        assert_abs_diff_eq!(normal, Vector3::x(), epsilon = 1e-12);
    }

    #[test]
    #[cfg(feature = "serde")]
    fn rejects_incomplete_fiducial() {
        let json = r#"{ "tag_size": 0.1, "fiducials": [ { "id": 1, "translation": [0, 0, 0] } ] }"#;
        assert!(matches!(
            AprilTagField::from_json_str(json),
            Err(FieldError::Transform { id: 1, .. })
        ));
    }
}
