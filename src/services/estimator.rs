//! Position estimation from corrected arrival times
//!
//! The estimator is a seam: the geometry engine only needs "timestamps from
//! N anchors in, position and uncertainty out". The default implementation
//! is time-difference-of-arrival multilateration.

use crate::domain::geometry::{Vec3, C_AIR};
use crate::domain::types::AnchorId;
use nalgebra::{Matrix4, Vector4};

/// One anchor's corrected arrival time of a single transmission
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub anchor_id: AnchorId,
    pub position: Vec3,
    /// Reference-timeline seconds
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PositionEstimate {
    pub position: Vec3,
    /// RMS range residual in meters
    pub uncertainty_m: f64,
    /// Estimated emission time on the reference timeline (seconds)
    pub emitted_at: f64,
}

pub trait PositionEstimator: Send {
    /// Fewest distinct anchors the estimator can work with
    fn min_anchors(&self) -> usize;

    /// None when the observations do not determine a finite position
    fn estimate(&self, observations: &[Observation]) -> Option<PositionEstimate>;
}

/// TDOA multilateration by Levenberg–Marquardt
///
/// Unknowns are the tag position and the range from the tag to the earliest
/// anchor, which absorbs the unknown emission time. For anchor `i`:
///
/// ```text
/// r_i = |p - a_i| - (c * (t_i - t_min) + o)
/// ```
#[derive(Debug, Clone)]
pub struct TdoaEstimator {
    max_iterations: usize,
}

const INITIAL_LAMBDA: f64 = 1e-3;
const MAX_LAMBDA: f64 = 1e12;
const STEP_TOLERANCE_M: f64 = 1e-9;

impl TdoaEstimator {
    pub fn new() -> Self {
        Self { max_iterations: 50 }
    }

    fn cost(state: &Vector4<f64>, anchors: &[Vec3], ranges: &[f64]) -> f64 {
        let p = Vec3::new(state[0], state[1], state[2]);
        anchors
            .iter()
            .zip(ranges)
            .map(|(a, tdoa)| {
                let r = (p - a).norm() - (tdoa + state[3]);
                r * r
            })
            .sum()
    }

    /// JᵀJ and Jᵀr at `state`
    fn normal_equations(state: &Vector4<f64>, anchors: &[Vec3], ranges: &[f64]) -> (Matrix4<f64>, Vector4<f64>) {
        let p = Vec3::new(state[0], state[1], state[2]);
        let mut jtj = Matrix4::zeros();
        let mut jtr = Vector4::zeros();
        for (a, tdoa) in anchors.iter().zip(ranges) {
            let diff = p - a;
            let dist = diff.norm().max(1e-9);
            let r = dist - (tdoa + state[3]);
            let row = Vector4::new(diff.x / dist, diff.y / dist, diff.z / dist, -1.0);
            jtj += row * row.transpose();
            jtr += row * r;
        }
        (jtj, jtr)
    }
}

impl Default for TdoaEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionEstimator for TdoaEstimator {
    fn min_anchors(&self) -> usize {
        4
    }

    fn estimate(&self, observations: &[Observation]) -> Option<PositionEstimate> {
        if observations.len() < self.min_anchors() {
            return None;
        }

        let earliest = observations
            .iter()
            .min_by(|a, b| a.timestamp.total_cmp(&b.timestamp))?;
        let t_min = earliest.timestamp;

        let anchors: Vec<Vec3> = observations.iter().map(|o| o.position).collect();
        let ranges: Vec<f64> = observations.iter().map(|o| C_AIR * (o.timestamp - t_min)).collect();

        let centroid = anchors.iter().fold(Vec3::zeros(), |acc, a| acc + a) / anchors.len() as f64;
        let mut state = Vector4::new(
            centroid.x,
            centroid.y,
            centroid.z,
            (centroid - earliest.position).norm(),
        );
        let mut cost = Self::cost(&state, &anchors, &ranges);
        let mut lambda = INITIAL_LAMBDA;

        for _ in 0..self.max_iterations {
            let (jtj, jtr) = Self::normal_equations(&state, &anchors, &ranges);
            let mut damped = jtj;
            for i in 0..4 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-9);
            }

            let Some(delta) = damped.lu().solve(&(-jtr)) else {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    break;
                }
                continue;
            };

            let candidate = state + delta;
            let candidate_cost = Self::cost(&candidate, &anchors, &ranges);
            if candidate_cost.is_finite() && candidate_cost < cost {
                state = candidate;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if delta.norm() < STEP_TOLERANCE_M {
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    break;
                }
            }
        }

        let position = Vec3::new(state[0], state[1], state[2]);
        if !position.iter().all(|v| v.is_finite()) || !cost.is_finite() {
            return None;
        }

        Some(PositionEstimate {
            position,
            uncertainty_m: (cost / observations.len() as f64).sqrt(),
            emitted_at: t_min - state[3] / C_AIR,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchors() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(20.0, 0.0, 0.0),
            Vec3::new(0.0, 20.0, 0.0),
            Vec3::new(0.0, 0.0, 10.0),
            Vec3::new(20.0, 20.0, 5.0),
        ]
    }

    fn observe(tag: Vec3, emitted_at: f64, anchors: &[Vec3]) -> Vec<Observation> {
        anchors
            .iter()
            .enumerate()
            .map(|(i, a)| Observation {
                anchor_id: AnchorId(0x11 + i as u8),
                position: *a,
                timestamp: emitted_at + (tag - a).norm() / C_AIR,
            })
            .collect()
    }

    #[test]
    fn test_recovers_position_inside_hull() {
        let tag = Vec3::new(5.0, 8.0, 3.0);
        let est = TdoaEstimator::new().estimate(&observe(tag, 100.0, &anchors())).unwrap();
        assert!((est.position - tag).norm() < 1e-3, "got {:?}", est.position);
        assert!(est.uncertainty_m < 1e-3);
        assert!((est.emitted_at - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_recovers_position_outside_hull() {
        let tag = Vec3::new(-3.0, 2.0, 1.0);
        let est = TdoaEstimator::new().estimate(&observe(tag, 42.5, &anchors())).unwrap();
        assert!((est.position - tag).norm() < 1e-2, "got {:?}", est.position);
    }

    #[test]
    fn test_needs_four_anchors() {
        let tag = Vec3::new(5.0, 8.0, 3.0);
        let obs = observe(tag, 0.0, &anchors()[..3]);
        assert!(TdoaEstimator::new().estimate(&obs).is_none());
    }

    #[test]
    fn test_noise_raises_uncertainty() {
        let tag = Vec3::new(5.0, 8.0, 3.0);
        let mut obs = observe(tag, 10.0, &anchors());
        // ~30 cm of range error on one anchor
        obs[3].timestamp += 1e-9;
        let est = TdoaEstimator::new().estimate(&obs).unwrap();
        assert!(est.uncertainty_m > 1e-3);
        assert!((est.position - tag).norm() < 1.0);
    }
}
