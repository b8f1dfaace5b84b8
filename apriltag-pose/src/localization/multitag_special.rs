use log::debug;
use nalgebra::{Point2, Point3, Rotation3};

use super::{LocalizationStrategy, StrategyKind};
use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::error::ConfigurationError;
use crate::euclidean::{rotation_distance, Transform};
use crate::field::AprilTagField;
use crate::pnp::{reprojection_error, solve_pnp, PnpMethod};

const NAME: &str = "multi-tag-special";

/// Errors below this are clamped before weighting.
const MIN_WEIGHTED_ERROR: f64 = 1e-9;

/// Source of the current world orientation in the camera frame, typically
/// an IMU reading. Always reflects the latest known value.
pub type AngleProducer = Box<dyn Fn() -> Rotation3<f64> + Send + Sync>;

/// Resolves each tag's planar ambiguity against an external orientation,
/// then fuses the per-tag poses with inverse-error weights.
pub struct MultiTagSpecialStrategy {
    angle_producer: AngleProducer,
    method: PnpMethod,
    fallback: Option<Box<dyn LocalizationStrategy>>,
}

impl std::fmt::Debug for MultiTagSpecialStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTagSpecialStrategy")
            .field("method", &self.method)
            .field("fallback", &self.fallback.as_ref().map(|s| s.name()))
            .finish_non_exhaustive()
    }
}

impl MultiTagSpecialStrategy {
    /// `angle_producer` is called once per estimate that has at least two
    /// detections, never cached.
    pub fn new(
        angle_producer: impl Fn() -> Rotation3<f64> + Send + Sync + 'static,
        method: PnpMethod,
    ) -> Self {
        Self {
            angle_producer: Box::new(angle_producer),
            method,
            fallback: None,
        }
    }

    pub fn with_fallback(
        mut self,
        fallback: Box<dyn LocalizationStrategy>,
    ) -> Result<Self, ConfigurationError> {
        if fallback.kind() == StrategyKind::MultiTagSpecial {
            return Err(ConfigurationError::ReflexiveFallback(NAME));
        }
        self.fallback = Some(fallback);
        Ok(self)
    }

    pub fn method(&self) -> PnpMethod {
        self.method
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

    /// The candidate for one tag whose rotation is closest to `external`.
    fn closest_candidate(
        &self,
        detection: &AprilTagDetection,
        field: &AprilTagField,
        camera: &CameraParameters,
        external: &Rotation3<f64>,
    ) -> Option<Transform> {
        let object = field.corners(detection.tag_id).ok()?;
        match solve_pnp(&object, &detection.corner_points(), camera, self.method) {
            Ok(candidates) => closest_to(candidates, external),
            Err(e) => {
                debug!("{}: tag {} not solved: {e}", self.name(), detection.tag_id);
                None
            }
        }
    }
}

fn closest_to(candidates: Vec<Transform>, external: &Rotation3<f64>) -> Option<Transform> {
    candidates.into_iter().min_by(|a, b| {
        let da = rotation_distance(a.rotation(), external);
        let db = rotation_distance(b.rotation(), external);
        da.total_cmp(&db)
    })
}

impl LocalizationStrategy for MultiTagSpecialStrategy {
    fn estimate(
        &self,
        detections: &[AprilTagDetection],
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform> {
        if detections.is_empty() {
            return None;
        }
        if detections.len() < 2 {
            return self.fall_back(detections, field, camera);
        }

        let external = (self.angle_producer)();
        let mut weighted = Vec::with_capacity(detections.len());
        let mut object: Vec<Point3<f64>> = Vec::new();
        let mut image: Vec<Point2<f64>> = Vec::new();
        for det in detections {
            let Some(pose) = self.closest_candidate(det, field, camera, &external) else {
                continue;
            };
            let weight = 1.0 / pose.error().unwrap_or(f64::INFINITY).max(MIN_WEIGHTED_ERROR);
            weighted.push((pose, weight));
            if let Ok(corners) = field.corners(det.tag_id) {
                object.extend(corners);
                image.extend(det.corner_points());
            }
        }

        let Some(fused) = Transform::weighted_mean(&weighted) else {
            debug!("{}: no tag could be solved, falling back", self.name());
            return self.fall_back(detections, field, camera);
        };
        let error = reprojection_error(&object, &image, camera, &fused);
        Some(fused.with_error(error))
    }

    fn name(&self) -> String {
        format!("{NAME}-{}", self.method)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MultiTagSpecial
    }
}
