//! Domain models - core data types
//!
//! This module contains the canonical data types used throughout the system:
//! - `BlinkEvent` - one anchor's timestamp of one tag blink
//! - `PassageEvent` - the tag's side of the pylon plane for one transmission
//! - `Decision` - the terminal VALID / PENALTY / NO_CALL call
//! - `SystemStatus` - periodic snapshot for operators
//! - `Plane`, `AnchorPosition` - fixed geometry from configuration
//! - `ProcessorError` - error taxonomy

pub mod error;
pub mod geometry;
pub mod types;

pub use error::ProcessorError;
pub use geometry::{AnchorPosition, Plane, Vec3};
