//! Pylon-plane classification of position fixes
//!
//! Turns one correlated transmission (blinks from several anchors) into a
//! `PassageEvent`: locate the tag, take its signed distance to the pylon
//! plane, pick a side, and score how much the call can be trusted.

use crate::domain::error::ProcessorError;
use crate::domain::geometry::{AnchorPosition, Plane, Vec3};
use crate::domain::types::{AnchorId, BlinkEvent, PassageEvent, Side, SyncState, TagId};
use crate::infra::metrics::Metrics;
use crate::services::estimator::{Observation, PositionEstimate, PositionEstimator, TdoaEstimator};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Distance factor for fixes inside the dead zone
const DEAD_ZONE_FACTOR: f64 = 0.1;

/// Confidence weight of the least healthy contributing anchor
pub fn sync_weight(state: SyncState) -> f64 {
    match state {
        SyncState::Ok => 1.0,
        SyncState::Degraded => 0.7,
        SyncState::Lost => 0.4,
    }
}

/// Low and flat inside the dead zone, rising from 0.6 towards 1.0 outside
fn distance_factor(signed_distance: f64, dead_zone_m: f64) -> f64 {
    let margin = signed_distance.abs() - dead_zone_m;
    if margin < 0.0 {
        return DEAD_ZONE_FACTOR;
    }
    let scale = if dead_zone_m > 0.0 { dead_zone_m } else { 1.0 };
    0.6 + 0.4 * (1.0 - (-margin / scale).exp())
}

fn uncertainty_factor(uncertainty_m: f64, dead_zone_m: f64) -> f64 {
    let scale = if dead_zone_m > 0.0 { dead_zone_m } else { 1.0 };
    1.0 / (1.0 + uncertainty_m.max(0.0) / scale)
}

pub struct GeometryEngine {
    plane: Plane,
    dead_zone_m: f64,
    min_anchors: usize,
    positions: FxHashMap<AnchorId, Vec3>,
    estimator: Box<dyn PositionEstimator>,
    metrics: Option<Arc<Metrics>>,
}

impl GeometryEngine {
    pub fn new(plane: Plane, dead_zone_m: f64, min_anchors: usize, anchors: &[AnchorPosition]) -> Self {
        let estimator = TdoaEstimator::new();
        Self {
            plane,
            dead_zone_m,
            min_anchors: min_anchors.max(estimator.min_anchors()),
            positions: anchors.iter().map(|a| (a.anchor_id, a.position)).collect(),
            estimator: Box::new(estimator),
            metrics: None,
        }
    }

    /// Swap in a different position estimator
    pub fn with_estimator(mut self, estimator: Box<dyn PositionEstimator>) -> Self {
        self.min_anchors = self.min_anchors.max(estimator.min_anchors());
        self.estimator = estimator;
        self
    }

    /// Record fix counts and uncertainty
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn min_anchors(&self) -> usize {
        self.min_anchors
    }

    pub fn plane(&self) -> &Plane {
        &self.plane
    }

    pub fn knows_anchor(&self, anchor_id: AnchorId) -> bool {
        self.positions.contains_key(&anchor_id)
    }

    /// Position fix from one transmission's blinks
    ///
    /// Only the first blink per anchor counts; anchors without a configured
    /// position are ignored.
    pub fn locate(&self, tag_id: TagId, blinks: &[BlinkEvent]) -> Result<PositionEstimate, ProcessorError> {
        let mut observations: Vec<Observation> = Vec::with_capacity(blinks.len());
        for blink in blinks {
            if observations.iter().any(|o| o.anchor_id == blink.anchor_id) {
                continue;
            }
            if let Some(position) = self.positions.get(&blink.anchor_id) {
                observations.push(Observation {
                    anchor_id: blink.anchor_id,
                    position: *position,
                    timestamp: blink.timestamp_corrected,
                });
            }
        }

        if observations.len() < self.min_anchors {
            return Err(ProcessorError::InsufficientAnchorsForFix {
                tag_id,
                required: self.min_anchors,
                available: observations.len(),
            });
        }

        self.estimator
            .estimate(&observations)
            .ok_or(ProcessorError::PositionUnresolved { tag_id, anchors: observations.len() })
    }

    /// Classify one transmission against the pylon plane
    pub fn classify<F>(&self, tag_id: TagId, blinks: &[BlinkEvent], health: F) -> Result<PassageEvent, ProcessorError>
    where
        F: Fn(AnchorId) -> SyncState,
    {
        let estimate = self.locate(tag_id, blinks)?;
        if let Some(ref metrics) = self.metrics {
            metrics.record_fix(estimate.uncertainty_m);
        }

        let sync_factor = blinks
            .iter()
            .filter(|b| self.knows_anchor(b.anchor_id))
            .map(|b| sync_weight(health(b.anchor_id)))
            .fold(1.0_f64, f64::min);

        let event = self.classify_position(
            tag_id,
            estimate.emitted_at,
            &estimate.position,
            estimate.uncertainty_m,
            sync_factor,
            blinks.to_vec(),
        );

        debug!(
            tag = %tag_id,
            x = format!("{:.2}", estimate.position.x),
            y = format!("{:.2}", estimate.position.y),
            z = format!("{:.2}", estimate.position.z),
            distance_m = format!("{:.2}", event.signed_distance),
            side = event.side.as_str(),
            confidence = format!("{:.2}", event.confidence),
            "passage_classified"
        );
        Ok(event)
    }

    /// Side and confidence for a known position
    pub fn classify_position(
        &self,
        tag_id: TagId,
        timestamp: f64,
        position: &Vec3,
        uncertainty_m: f64,
        sync_factor: f64,
        raw_blinks: Vec<BlinkEvent>,
    ) -> PassageEvent {
        let signed_distance = self.plane.signed_distance(position);
        let side = if signed_distance.abs() < self.dead_zone_m {
            Side::DeadZone
        } else if signed_distance > 0.0 {
            Side::Exterior
        } else {
            Side::Interior
        };

        let confidence = (distance_factor(signed_distance, self.dead_zone_m)
            * sync_factor.clamp(0.0, 1.0)
            * uncertainty_factor(uncertainty_m, self.dead_zone_m))
        .clamp(0.0, 1.0);

        PassageEvent { tag_id, timestamp, side, signed_distance, confidence, raw_blinks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geometry::C_AIR;
    use std::time::Instant;

    const TAG: TagId = TagId(0x0010);

    fn anchors() -> Vec<AnchorPosition> {
        vec![
            AnchorPosition::new(AnchorId(0x11), [0.0, -10.0, 0.5]),
            AnchorPosition::new(AnchorId(0x12), [0.0, 10.0, 0.5]),
            AnchorPosition::new(AnchorId(0x13), [-15.0, 0.0, 6.0]),
            AnchorPosition::new(AnchorId(0x14), [15.0, 0.0, 3.0]),
            AnchorPosition::new(AnchorId(0x15), [5.0, 5.0, 8.0]),
        ]
    }

    fn engine(normal: [f64; 3]) -> GeometryEngine {
        let plane = Plane::new([0.0, 0.0, 0.0], normal).unwrap();
        GeometryEngine::new(plane, 1.0, 4, &anchors())
    }

    fn at(engine: &GeometryEngine, x: f64) -> PassageEvent {
        engine.classify_position(TAG, 0.0, &Vec3::new(x, 0.0, 2.0), 0.0, 1.0, Vec::new())
    }

    fn blinks_from(tag: Vec3, anchors: &[AnchorPosition]) -> Vec<BlinkEvent> {
        anchors
            .iter()
            .enumerate()
            .map(|(i, a)| BlinkEvent {
                anchor_id: a.anchor_id,
                tag_id: TAG,
                seq_num: i as u16,
                timestamp_raw: 0,
                timestamp_corrected: 5.0 + (tag - a.position).norm() / C_AIR,
                rssi: -70,
                received_at: Instant::now(),
            })
            .collect()
    }

    #[test]
    fn test_dead_zone_and_exterior() {
        let e = engine([1.0, 0.0, 0.0]);
        assert_eq!(at(&e, 0.5).side, Side::DeadZone);
        assert_eq!(at(&e, 2.0).side, Side::Exterior);
        assert_eq!(at(&e, -2.0).side, Side::Interior);
    }

    #[test]
    fn test_normal_negation_flips_side() {
        let e = engine([1.0, 0.0, 0.0]);
        let flipped = engine([-1.0, 0.0, 0.0]);
        for x in [-4.0, -1.5, -0.3, 0.0, 0.7, 2.0, 9.0] {
            let a = at(&e, x);
            let b = at(&flipped, x);
            assert!((a.signed_distance + b.signed_distance).abs() < 1e-12);
            assert!((a.confidence - b.confidence).abs() < 1e-12);
            if a.side == Side::DeadZone {
                assert_eq!(b.side, Side::DeadZone);
            } else {
                assert_eq!(b.side, a.side.opposite());
            }
        }
    }

    #[test]
    fn test_confidence_rises_with_distance() {
        let e = engine([1.0, 0.0, 0.0]);
        let dz = at(&e, 0.5).confidence;
        let near = at(&e, 1.2).confidence;
        let far = at(&e, 6.0).confidence;
        assert!((dz - DEAD_ZONE_FACTOR).abs() < 1e-12);
        assert!(dz < near && near < far);
        assert!(far <= 1.0);
    }

    #[test]
    fn test_confidence_penalised_by_sync_and_uncertainty() {
        let e = engine([1.0, 0.0, 0.0]);
        let p = Vec3::new(3.0, 0.0, 2.0);
        let clean = e.classify_position(TAG, 0.0, &p, 0.0, 1.0, Vec::new()).confidence;
        let lost = e.classify_position(TAG, 0.0, &p, 0.0, sync_weight(SyncState::Lost), Vec::new());
        let fuzzy = e.classify_position(TAG, 0.0, &p, 1.0, 1.0, Vec::new());
        assert!((lost.confidence - clean * 0.4).abs() < 1e-12);
        assert!((fuzzy.confidence - clean * 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_classify_from_blinks() {
        let e = engine([1.0, 0.0, 0.0]);
        let blinks = blinks_from(Vec3::new(4.0, 1.0, 2.0), &anchors());
        let event = e.classify(TAG, &blinks, |_| SyncState::Ok).unwrap();
        assert_eq!(event.side, Side::Exterior);
        assert!((event.signed_distance - 4.0).abs() < 0.01);
        assert!((event.timestamp - 5.0).abs() < 1e-9);
        assert_eq!(event.raw_blinks.len(), 5);
    }

    #[test]
    fn test_classify_uses_weakest_anchor() {
        let e = engine([1.0, 0.0, 0.0]);
        let blinks = blinks_from(Vec3::new(-4.0, 1.0, 2.0), &anchors());
        let ok = e.classify(TAG, &blinks, |_| SyncState::Ok).unwrap();
        let degraded = e
            .classify(TAG, &blinks, |id| if id == AnchorId(0x13) { SyncState::Degraded } else { SyncState::Ok })
            .unwrap();
        assert_eq!(degraded.side, Side::Interior);
        assert!((degraded.confidence - ok.confidence * 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_classify_insufficient_anchors() {
        let e = engine([1.0, 0.0, 0.0]);
        let mut blinks = blinks_from(Vec3::new(4.0, 1.0, 2.0), &anchors()[..3]);
        // Unknown anchor does not count
        blinks.push(BlinkEvent { anchor_id: AnchorId(0x21), ..blinks[0].clone() });
        let err = e.classify(TAG, &blinks, |_| SyncState::Ok).unwrap_err();
        assert_eq!(err, ProcessorError::InsufficientAnchorsForFix { tag_id: TAG, required: 4, available: 3 });
    }
}
