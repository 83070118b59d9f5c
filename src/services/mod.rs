//! Services - the processing pipeline
//!
//! This module contains the core processing stages:
//! - `clock_sync` - per-anchor clock models onto the master timeline
//! - `sync_correlator` - pairs slave sync timestamps with the master's broadcasts
//! - `correlator` - groups one transmission's blinks across anchors
//! - `estimator` - TDOA position solver
//! - `geometry` - side of the pylon plane and confidence per transmission
//! - `decision` - per-tag decision windows
//! - `processor` - single consumer wiring the stages together

pub mod clock_sync;
pub mod correlator;
pub mod decision;
pub mod estimator;
pub mod geometry;
pub mod processor;
pub mod sync_correlator;

// Re-export commonly used types
pub use clock_sync::{ClockModel, ClockSync};
pub use decision::{DecisionConfig, DecisionEngine};
pub use geometry::GeometryEngine;
pub use processor::Processor;
