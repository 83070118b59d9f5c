//! Pylon plane and anchor geometry

use crate::domain::error::ProcessorError;
use crate::domain::types::AnchorId;
use nalgebra::Vector3;

pub type Vec3 = Vector3<f64>;

/// Speed of light in air (m/s)
pub const C_AIR: f64 = 299_792_458.0 / 1.00032;

/// Fixed anchor position from configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorPosition {
    pub anchor_id: AnchorId,
    pub position: Vec3,
}

impl AnchorPosition {
    pub fn new(anchor_id: AnchorId, position: [f64; 3]) -> Self {
        Self { anchor_id, position: Vec3::from(position) }
    }
}

/// Vertical detection plane at a pylon
///
/// The normal points towards EXTERIOR and is unit length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    point: Vec3,
    normal: Vec3,
}

impl Plane {
    pub fn new(point: [f64; 3], normal: [f64; 3]) -> Result<Self, ProcessorError> {
        let point = Vec3::from(point);
        let normal = Vec3::from(normal);
        if !point.iter().all(|v| v.is_finite()) || !normal.iter().all(|v| v.is_finite()) {
            return Err(ProcessorError::InvalidPlaneConfig("non-finite coordinates".into()));
        }
        let norm = normal.norm();
        if norm < f64::EPSILON {
            return Err(ProcessorError::InvalidPlaneConfig("zero-length normal".into()));
        }
        Ok(Self { point, normal: normal / norm })
    }

    pub fn point(&self) -> &Vec3 {
        &self.point
    }

    pub fn normal(&self) -> &Vec3 {
        &self.normal
    }

    /// Same plane, normal reversed (EXTERIOR and INTERIOR swap)
    pub fn flipped(&self) -> Self {
        Self { point: self.point, normal: -self.normal }
    }

    /// Positive on the EXTERIOR side
    #[inline]
    pub fn signed_distance(&self, position: &Vec3) -> f64 {
        (position - self.point).dot(&self.normal)
    }
}
