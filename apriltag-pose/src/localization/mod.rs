//! Camera localization from one or more detected tags.
//!
//! Every strategy answers the same question: where is the world origin in
//! the camera frame? The result is not inverted; call
//! [`Transform::inverse`] for the camera pose in the world.

mod localizer;
mod lowest_ambiguity;
mod multitag_pnp;
mod multitag_special;

pub use localizer::{CameraLocalizer, LocalizationResult};
pub use lowest_ambiguity::LowestAmbiguityStrategy;
pub use multitag_pnp::MultiTagPnpStrategy;
pub use multitag_special::{AngleProducer, MultiTagSpecialStrategy};

use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::euclidean::Transform;
use crate::field::AprilTagField;

/// Which built-in strategy an implementation is, used to refuse fallbacks
/// that would loop back into the same kind of strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    LowestAmbiguity,
    MultiTagPnp,
    MultiTagSpecial,
    Custom,
}

/// Estimates the pose of the world origin in the camera frame.
///
/// Detections are expected to reference tags present in `field`;
/// [`CameraLocalizer`] filters them before calling. `None` means no
/// estimate could be made, which is a normal outcome.
pub trait LocalizationStrategy: Send + Sync {
    fn estimate(
        &self,
        detections: &[AprilTagDetection],
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform>;

    fn name(&self) -> String;

    fn kind(&self) -> StrategyKind {
        StrategyKind::Custom
    }
}

impl<S: LocalizationStrategy + ?Sized> LocalizationStrategy for Box<S> {
    fn estimate(
        &self,
        detections: &[AprilTagDetection],
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform> {
        (**self).estimate(detections, field, camera)
    }

    fn name(&self) -> String {
        (**self).name()
    }

    fn kind(&self) -> StrategyKind {
        (**self).kind()
    }
}

/// Ratio of the best to the second-best error.
///
/// A zero second error means both candidates fit perfectly, which is
/// treated as fully ambiguous: `0/0` is 1.0, not the 0.0 of maximal
/// confidence. A zero best error against a positive second error still
/// gives 0.0, the most confident ratio.
pub fn ambiguity_ratio(best_error: f64, second_error: f64) -> f64 {
    if second_error <= 0.0 {
        1.0
    } else {
        best_error / second_error
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use nalgebra::{Rotation3, Vector3};

    use super::*;
    use crate::camera::DEPSTECH;

    pub const TAG_SIZE: f64 = 0.2;

    pub fn camera() -> CameraParameters {
        DEPSTECH
    }

    /// Three tags on a wall 4 m in front of a camera at the origin, rotated
    /// so the wall is not parallel to the image plane.
    pub fn field() -> AprilTagField {
        let facing_camera = Rotation3::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI);
        let tags = [
            (1, Vector3::new(-0.6, 0.1, 4.0)),
            (2, Vector3::new(0.5, -0.2, 4.3)),
            (3, Vector3::new(0.1, 0.4, 3.6)),
        ]
        .map(|(id, t)| {
            let tilt = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.1 * id as f64);
            (id, Transform::new(facing_camera * tilt, t))
        });
        AprilTagField::new(TAG_SIZE, "tag36h11", tags).unwrap()
    }

    pub fn world_in_camera() -> Transform {
        Transform::from_rotation_vector(
            Vector3::new(0.02, 0.15, -0.03),
            Vector3::new(0.1, -0.05, 0.2),
        )
    }

    /// Noise-free detections of `ids` as seen through `world_in_camera`.
    pub fn detections(ids: &[u32], world_in_camera: &Transform) -> Vec<AprilTagDetection> {
        let field = field();
        let camera = camera();
        ids.iter()
            .map(|&id| {
                let corners = field.corners(id).unwrap().map(|p| {
                    let q = camera.project(&world_in_camera.transform_point(&p));
                    [q.x, q.y]
                });
                let c = camera.project(&world_in_camera.transform_point(
                    &nalgebra::Point3::from(*field.get(id).unwrap().translation()),
                ));
                AprilTagDetection::new(id, "tag36h11", [c.x, c.y], corners)
            })
            .collect()
    }

    /// Returns a fixed, recognizable pose.
    pub struct Sentinel;

    impl Sentinel {
        pub fn pose() -> Transform {
            Transform::from_rotation_vector(
                Vector3::new(0.1, 0.2, 0.3),
                Vector3::new(1.0, 2.0, 3.0),
            )
            .with_error(42.0)
        }
    }

    impl LocalizationStrategy for Sentinel {
        fn estimate(
            &self,
            _detections: &[AprilTagDetection],
            _field: &AprilTagField,
            _camera: &CameraParameters,
        ) -> Option<Transform> {
            Some(Self::pose())
        }

        fn name(&self) -> String {
            "sentinel".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn ambiguity_tie_rules() {
        assert_eq!(ambiguity_ratio(0.5, 2.0), 0.25);
        assert_eq!(ambiguity_ratio(0.0, 0.0), 1.0);
        assert_eq!(ambiguity_ratio(0.0, 1.0), 0.0);
    }

    #[test]
    fn boxed_strategy_delegates() {
        let boxed: Box<dyn LocalizationStrategy> = Box::new(Sentinel);
        assert_eq!(boxed.kind(), StrategyKind::Custom);
        assert_eq!(boxed.name(), "sentinel");
        assert_eq!(boxed.estimate(&[], &field(), &camera()), Some(Sentinel::pose()));
    }

    #[test]
    fn every_strategy_ignores_empty_input() {
        let strategies: Vec<Box<dyn LocalizationStrategy>> = vec![
            Box::new(LowestAmbiguityStrategy::default()),
            Box::new(MultiTagPnpStrategy::default().with_fallback(Box::new(Sentinel)).unwrap()),
            Box::new(
                MultiTagSpecialStrategy::new(nalgebra::Rotation3::identity, crate::PnpMethod::Ippe)
                    .with_fallback(Box::new(Sentinel))
                    .unwrap(),
            ),
        ];
        for s in &strategies {
            assert_eq!(s.estimate(&[], &field(), &camera()), None, "{}", s.name());
        }
    }
}
