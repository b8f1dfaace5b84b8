use log::debug;

use super::{ambiguity_ratio, LocalizationStrategy, StrategyKind};
use crate::camera::CameraParameters;
use crate::detection::AprilTagDetection;
use crate::euclidean::Transform;
use crate::field::AprilTagField;
use crate::pnp::{solve_pnp, sort_by_error, PnpMethod};

/// Solves every tag on its own and keeps the least ambiguous estimate.
///
/// For each tag the best PnP candidate is tagged with
/// `best.error / second.error`. A low ratio means the planar ambiguity was
/// resolved sharply, so that tag's estimate wins. Tags with a single
/// candidate carry no ratio and lose to any tag that has one.
#[derive(Debug, Clone, Copy)]
pub struct LowestAmbiguityStrategy {
    method: PnpMethod,
}

impl Default for LowestAmbiguityStrategy {
    fn default() -> Self {
        Self::new(PnpMethod::Ippe)
    }
}

impl LowestAmbiguityStrategy {
    pub fn new(method: PnpMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> PnpMethod {
        self.method
    }

    fn best_candidate(
        &self,
        detection: &AprilTagDetection,
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform> {
        let object = match field.corners(detection.tag_id) {
            Ok(corners) => corners,
            Err(e) => {
                debug!("{}: skipping detection: {e}", self.name());
                return None;
            }
        };
        let image = detection.corner_points();
        let mut candidates = match solve_pnp(&object, &image, camera, self.method) {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!("{}: tag {} not solved: {e}", self.name(), detection.tag_id);
                return None;
            }
        };
        sort_by_error(&mut candidates);
        let mut candidates = candidates.into_iter();
        let best = candidates.next()?;
        match candidates.next() {
            Some(second) => {
                let ratio = ambiguity_ratio(
                    best.error().unwrap_or(f64::INFINITY),
                    second.error().unwrap_or(f64::INFINITY),
                );
                Some(best.with_ambiguity(ratio))
            }
            None => Some(best),
        }
    }
}

impl LocalizationStrategy for LowestAmbiguityStrategy {
    fn estimate(
        &self,
        detections: &[AprilTagDetection],
        field: &AprilTagField,
        camera: &CameraParameters,
    ) -> Option<Transform> {
        detections
            .iter()
            .filter_map(|det| self.best_candidate(det, field, camera))
            .min_by(|a, b| ambiguity_key(a).total_cmp(&ambiguity_key(b)))
    }

    fn name(&self) -> String {
        format!("lowest-ambiguity-{}", self.method)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::LowestAmbiguity
    }
}

fn ambiguity_key(t: &Transform) -> f64 {
    t.ambiguity().unwrap_or(f64::INFINITY)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn recovers_pose_from_each_tag() {
        let truth = world_in_camera();
        let strategy = LowestAmbiguityStrategy::default();
        for ids in [vec![1], vec![2], vec![1, 2, 3]] {
            let pose = strategy
                .estimate(&detections(&ids, &truth), &field(), &camera())
                .expect("pose");
            assert!(pose.angle_to(&truth) < 1e-6, "{ids:?}");
            assert!((pose.translation() - truth.translation()).norm() < 1e-6, "{ids:?}");
            let ratio = pose.ambiguity().expect("ippe yields two candidates");
            assert!((0.0..=1.0).contains(&ratio));
        }
    }

    #[test]
    fn picks_smallest_ratio() {
        let truth = world_in_camera();
        let strategy = LowestAmbiguityStrategy::default();
        let dets = detections(&[1, 2, 3], &truth);
        let expected = dets
            .iter()
            .filter_map(|d| strategy.best_candidate(d, &field(), &camera()))
            .map(|p| p.ambiguity().unwrap())
            .fold(f64::INFINITY, f64::min);
        let pose = strategy.estimate(&dets, &field(), &camera()).unwrap();
        assert_eq!(pose.ambiguity(), Some(expected));
    }

    #[test]
    fn single_candidate_has_no_ambiguity() {
        let truth = world_in_camera();
        let strategy = LowestAmbiguityStrategy::new(PnpMethod::Sqpnp);
        let pose = strategy.estimate(&detections(&[3], &truth), &field(), &camera()).unwrap();
        assert_eq!(pose.ambiguity(), None);
        assert!(pose.angle_to(&truth) < 1e-6);
    }

    #[test]
    fn failed_tags_are_skipped() {
        let truth = world_in_camera();
        let mut dets = detections(&[1, 2], &truth);
        dets[0].corners = [[100.0, 100.0]; 4];
        // unknown to the field
        dets.push(AprilTagDetection::new(99, "tag36h11", [0.0, 0.0], [[1.0, 1.0]; 4]));
        let pose = LowestAmbiguityStrategy::default()
            .estimate(&dets, &field(), &camera())
            .unwrap();
        assert!(pose.angle_to(&truth) < 1e-6);

        dets.remove(1);
        assert!(LowestAmbiguityStrategy::default()
            .estimate(&dets, &field(), &camera())
            .is_none());
    }

    #[test]
    fn empty_input() {
        assert!(LowestAmbiguityStrategy::default()
            .estimate(&[], &field(), &camera())
            .is_none());
    }
}
