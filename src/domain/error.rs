//! Error taxonomy for the processing pipeline
//!
//! Only configuration errors are fatal, and only at startup. Everything
//! else is recovered locally and surfaced through metrics and `SystemStatus`.

use crate::domain::types::{AnchorId, TagId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProcessorError {
    /// Resync needs at least two samples with distinct raw times
    #[error("Insufficient sync samples for anchor {anchor_id}: need {required}, have {available}")]
    InsufficientSyncSamples { anchor_id: AnchorId, required: usize, available: usize },

    #[error("Anchor {anchor_id} clock lost: last sync {age_ms} ms ago")]
    AnchorClockLost { anchor_id: AnchorId, age_ms: u64 },

    #[error("Insufficient anchors for fix on tag {tag_id}: need {required}, have {available}")]
    InsufficientAnchorsForFix { tag_id: TagId, required: usize, available: usize },

    /// Enough anchors, but the solver did not converge to a finite position
    #[error("No position fix for tag {tag_id} from {anchors} anchors")]
    PositionUnresolved { tag_id: TagId, anchors: usize },

    #[error("Invalid pylon plane: {0}")]
    InvalidPlaneConfig(String),

    #[error("Queue full: {queue}")]
    QueueFull { queue: &'static str },

    /// Duplicate or out-of-order sequence number from an anchor
    #[error("Sequence fault on anchor {anchor_id}: last {last}, got {got}")]
    SequenceFault { anchor_id: AnchorId, last: u32, got: u32 },

    #[error("Unknown anchor {0}")]
    UnknownAnchor(AnchorId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProcessorError {
    /// Startup errors stop the process; everything else is counted and skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::InvalidPlaneConfig(_) | ProcessorError::InvalidConfig(_))
    }
}
