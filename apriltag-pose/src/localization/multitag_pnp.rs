use log::debug;
use nalgebra::Point2;

use super::{LocalizationStrategy, StrategyKind};
use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::error::ConfigurationError;
use crate::euclidean::Transform;
use crate::field::AprilTagField;
use crate::pnp::{solve_pnp, PnpMethod};

const NAME: &str = "multi-tag-pnp";

/// Stacks the corners of every detected tag into one PnP problem.
///
/// With two or more tags the combined point set is generally not coplanar,
/// so a single solve pins down the pose without the per-tag flip ambiguity.
/// A single detection, or a combined solve that fails, is handed to the
/// fallback strategy.
pub struct MultiTagPnpStrategy {
    method: PnpMethod,
    fallback: Option<Box<dyn LocalizationStrategy>>,
}

impl Default for MultiTagPnpStrategy {
    fn default() -> Self {
        Self {
            method: PnpMethod::Sqpnp,
            fallback: None,
        }
    }
}

impl std::fmt::Debug for MultiTagPnpStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTagPnpStrategy")
            .field("method", &self.method)
            .field("fallback", &self.fallback.as_ref().map(|s| s.name()))
            .finish()
    }
}

impl MultiTagPnpStrategy {
    /// Fails for planar-only methods, which cannot handle corners spread
    /// over several tags.
    pub fn new(method: PnpMethod) -> Result<Self, ConfigurationError> {
        if method.is_planar_only() {
            return Err(ConfigurationError::PlanarMethod {
                strategy: NAME,
                method,
            });
        }
        Ok(Self {
            method,
            fallback: None,
        })
    }

    /// Strategy consulted for single detections and failed solves.
    pub fn with_fallback(
        mut self,
        fallback: Box<dyn LocalizationStrategy>,
    ) -> Result<Self, ConfigurationError> {
        if fallback.kind() == StrategyKind::MultiTagPnp {
            return Err(ConfigurationError::ReflexiveFallback(NAME));
        }
        self.fallback = Some(fallback);
        Ok(self)
    }

    pub fn method(&self) -> PnpMethod {
        self.method
    }

    pub fn fallback(&self) -> Option<&dyn LocalizationStrategy> {
        self.fallback.as_deref()
    }

    fn fall_back(
        &self,
        detections: &[AprilTagDetection],
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform> {
        self.fallback
            .as_ref()
            .and_then(|f| f.estimate(detections, field, camera))
    }
}

impl LocalizationStrategy for MultiTagPnpStrategy {
    fn estimate(
        &self,
        detections: &[AprilTagDetection],
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform> {
        match detections.len() {
            0 => return None,
            1 => return self.fall_back(detections, field, camera),
            _ => {}
        }

        let ids: Vec<u32> = detections.iter().map(|d| d.tag_id).collect();
        let object = match field.get_corners(&ids) {
            Ok(points) => points,
            Err(e) => {
                debug!("{}: {e}, falling back", self.name());
                return self.fall_back(detections, field, camera);
            }
        };
        let image: Vec<Point2<f64>> = detections.iter().flat_map(|d| d.corner_points()).collect();

        match solve_pnp(&object, &image, camera, self.method) {
            Ok(candidates) => {
                let best = candidates.into_iter().min_by(|a, b| {
                    let ea = a.error().unwrap_or(f64::INFINITY);
                    let eb = b.error().unwrap_or(f64::INFINITY);
                    ea.total_cmp(&eb)
                });
                if best.is_none() {
                    debug!("{}: no candidates, falling back", self.name());
                    return self.fall_back(detections, field, camera);
                }
                best
            }
            Err(e) => {
                debug!("{}: {e}, falling back", self.name());
                self.fall_back(detections, field, camera)
            }
        }
    }

    fn name(&self) -> String {
        format!("{NAME}-{}", self.method)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MultiTagPnp
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::LowestAmbiguityStrategy;
    use super::*;

    #[test]
    fn single_detection_returns_fallback_result() {
        let truth = world_in_camera();
        let strategy = MultiTagPnpStrategy::default()
            .with_fallback(Box::new(Sentinel))
            .unwrap();
        let pose = strategy.estimate(&detections(&[2], &truth), &field(), &camera());
        assert_eq!(pose, Some(Sentinel::pose()));

        let bare = MultiTagPnpStrategy::default();
        assert!(bare.estimate(&detections(&[2], &truth), &field(), &camera()).is_none());
    }

    #[test]
    fn construction_guards() {
        assert_eq!(
            MultiTagPnpStrategy::new(PnpMethod::Ippe).unwrap_err(),
            ConfigurationError::PlanarMethod {
                strategy: "multi-tag-pnp",
                method: PnpMethod::Ippe,
            }
        );
        let reflexive = MultiTagPnpStrategy::default()
            .with_fallback(Box::new(MultiTagPnpStrategy::default()));
        assert_eq!(
            reflexive.unwrap_err(),
            ConfigurationError::ReflexiveFallback("multi-tag-pnp")
        );
        assert!(MultiTagPnpStrategy::new(PnpMethod::Iterative)
            .unwrap()
            .with_fallback(Box::new(LowestAmbiguityStrategy::default()))
            .is_ok());
    }

    #[test]
    fn recovers_pose_from_stacked_corners() {
        let truth = world_in_camera();
        for method in [PnpMethod::Sqpnp, PnpMethod::Iterative] {
            let strategy = MultiTagPnpStrategy::new(method).unwrap();
            let pose = strategy
                .estimate(&detections(&[1, 2, 3], &truth), &field(), &camera())
                .expect("pose");
            assert!(pose.angle_to(&truth) < 1e-6, "{method}");
            assert!((pose.translation() - truth.translation()).norm() < 1e-6, "{method}");
            assert!(pose.error().unwrap() < 1e-3, "{method}");
        }
    }

    #[test]
    fn failed_solve_falls_back() {
        let truth = world_in_camera();
        let mut dets = detections(&[1, 3], &truth);
        dets[1].corners[2] = [f64::NAN, 0.0];
        let strategy = MultiTagPnpStrategy::default()
            .with_fallback(Box::new(Sentinel))
            .unwrap();
        assert_eq!(strategy.estimate(&dets, &field(), &camera()), Some(Sentinel::pose()));
        assert!(MultiTagPnpStrategy::default()
            .estimate(&dets, &field(), &camera())
            .is_none());
    }

    #[test]
    fn empty_input_skips_fallback() {
        let strategy = MultiTagPnpStrategy::default()
            .with_fallback(Box::new(Sentinel))
            .unwrap();
        assert!(strategy.estimate(&[], &field(), &camera()).is_none());
        assert_eq!(strategy.name(), "multi-tag-pnp-sqpnp");
        assert_eq!(strategy.fallback().map(|f| f.name()), Some("sentinel".to_string()));
    }
}
