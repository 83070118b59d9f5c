//! Shared types for the pylon processor

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for anchor IDs (one byte on the RS485 wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct AnchorId(pub u8);

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Newtype wrapper for tag IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
pub struct TagId(pub u16);

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A blink as timestamped by one anchor
///
/// Produced by the collector. `timestamp_corrected` stays 0.0 until
/// ClockSync fills it; after that the event is read-only.
#[derive(Debug, Clone)]
pub struct BlinkEvent {
    pub anchor_id: AnchorId,
    pub tag_id: TagId,
    /// Per-anchor sequence counter (16-bit on the wire, wraps)
    pub seq_num: u16,
    /// 40-bit hardware timestamp in anchor clock ticks
    pub timestamp_raw: u64,
    /// Reference-timeline time in seconds
    pub timestamp_corrected: f64,
    pub rssi: i8,
    pub received_at: Instant,
}

/// One anchor's timestamp of one master sync broadcast
#[derive(Debug, Clone)]
pub struct SyncObservation {
    pub anchor_id: AnchorId,
    pub sync_count: u32,
    pub timestamp_raw: u64,
    pub received_at: Instant,
}

/// Health as reported by the anchor firmware itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorReportedStatus {
    Ok,
    Degraded,
    Error,
    Unknown(u8),
}

impl AnchorReportedStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => AnchorReportedStatus::Ok,
            1 => AnchorReportedStatus::Degraded,
            2 => AnchorReportedStatus::Error,
            other => AnchorReportedStatus::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorReportedStatus::Ok => "ok",
            AnchorReportedStatus::Degraded => "degraded",
            AnchorReportedStatus::Error => "error",
            AnchorReportedStatus::Unknown(_) => "unknown",
        }
    }
}

/// Anchor self-report (status frame)
#[derive(Debug, Clone)]
pub struct AnchorReport {
    pub anchor_id: AnchorId,
    pub status: AnchorReportedStatus,
    pub drift_ppm: i16,
    pub last_sync_age_ms: u16,
}

/// Everything the collector can hand to the processor
#[derive(Debug, Clone)]
pub enum CollectorMessage {
    Blink(BlinkEvent),
    Sync(SyncObservation),
    AnchorReport(AnchorReport),
}

/// Which side of the pylon plane the tag was on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Exterior,
    Interior,
    DeadZone,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Exterior => "EXTERIOR",
            Side::Interior => "INTERIOR",
            Side::DeadZone => "DEAD_ZONE",
        }
    }

    /// The other side of the plane (DEAD_ZONE has none)
    pub fn opposite(&self) -> Side {
        match self {
            Side::Exterior => Side::Interior,
            Side::Interior => Side::Exterior,
            Side::DeadZone => Side::DeadZone,
        }
    }
}

/// Geometry result for one correlated transmission
#[derive(Debug, Clone)]
pub struct PassageEvent {
    pub tag_id: TagId,
    /// Reference-timeline time in seconds
    pub timestamp: f64,
    pub side: Side,
    pub signed_distance: f64,
    pub confidence: f64,
    pub raw_blinks: Vec<BlinkEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionResult {
    Valid,
    Penalty,
    NoCall,
}

impl DecisionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionResult::Valid => "VALID",
            DecisionResult::Penalty => "PENALTY",
            DecisionResult::NoCall => "NO_CALL",
        }
    }
}

/// Machine-readable code for the branch that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    CrossingConfirmed,
    DirectionReversed,
    WrongDirection,
    LowConfidence,
    DeadZoneLinger,
    InsufficientBlinks,
    NoCrossing,
    Shutdown,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::CrossingConfirmed => "crossing_confirmed",
            DecisionReason::DirectionReversed => "direction_reversed",
            DecisionReason::WrongDirection => "wrong_direction",
            DecisionReason::LowConfidence => "low_confidence",
            DecisionReason::DeadZoneLinger => "dead_zone_linger",
            DecisionReason::InsufficientBlinks => "insufficient_blinks",
            DecisionReason::NoCrossing => "no_crossing",
            DecisionReason::Shutdown => "shutdown",
        }
    }
}

/// Final call for one decision window
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub tag_id: TagId,
    pub result: DecisionResult,
    pub reason: DecisionReason,
    pub confidence: f64,
    pub supporting_blinks: u32,
    /// Reference-timeline time in seconds of the last evidence considered
    pub timestamp: f64,
    pub pylon_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Ok,
    Degraded,
    Lost,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Ok => "OK",
            SyncState::Degraded => "DEGRADED",
            SyncState::Lost => "LOST",
        }
    }
}

/// Per-anchor clock sync snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub anchor_id: AnchorId,
    pub status: SyncState,
    pub drift_ppm: f64,
    pub last_sync_age_ms: u64,
    pub a: f64,
    pub b: f64,
}

/// Process-wide status snapshot, rebuilt on every status tick
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Epoch ms at which the snapshot was built
    pub ts: u64,
    pub anchors: BTreeMap<AnchorId, SyncStatus>,
    pub tags_seen: BTreeSet<TagId>,
    pub total_blinks: u64,
    pub total_decisions: u64,
    pub uptime_seconds: f64,
    /// Blinks that never became part of a position fix
    pub dropped_no_fix: u64,
    /// Duplicate or out-of-order sequence numbers
    pub sequence_faults: u64,
    /// Outbound events that could not be queued
    pub outbound_dropped: u64,
    pub open_windows: usize,
    pub degraded: bool,
}

/// Item on the outbound (processor → webapp) queue
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Decision(Decision),
    Status(SystemStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Exterior.opposite(), Side::Interior);
        assert_eq!(Side::Interior.opposite(), Side::Exterior);
        assert_eq!(Side::DeadZone.opposite(), Side::DeadZone);
    }

    #[test]
    fn test_anchor_reported_status_from_code() {
        assert_eq!(AnchorReportedStatus::from_code(0), AnchorReportedStatus::Ok);
        assert_eq!(AnchorReportedStatus::from_code(2), AnchorReportedStatus::Error);
        assert_eq!(AnchorReportedStatus::from_code(9), AnchorReportedStatus::Unknown(9));
    }

    #[test]
    fn test_decision_serializes_with_codes() {
        let event = OutboundEvent::Decision(Decision {
            tag_id: TagId(16),
            result: DecisionResult::NoCall,
            reason: DecisionReason::InsufficientBlinks,
            confidence: 0.5,
            supporting_blinks: 2,
            timestamp: 1.25,
            pylon_id: 1,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"decision""#));
        assert!(json.contains(r#""result":"NO_CALL""#));
        assert!(json.contains(r#""reason":"insufficient_blinks""#));
        assert!(json.contains(r#""tag_id":16"#));
    }

    #[test]
    fn test_status_serializes_anchor_keys() {
        let mut anchors = BTreeMap::new();
        anchors.insert(
            AnchorId(17),
            SyncStatus {
                anchor_id: AnchorId(17),
                status: SyncState::Ok,
                drift_ppm: 0.0,
                last_sync_age_ms: 0,
                a: 1.0,
                b: 0.0,
            },
        );
        let status = SystemStatus {
            ts: 0,
            anchors,
            tags_seen: BTreeSet::from([TagId(16)]),
            total_blinks: 4,
            total_decisions: 1,
            uptime_seconds: 2.0,
            dropped_no_fix: 0,
            sequence_faults: 0,
            outbound_dropped: 0,
            open_windows: 0,
            degraded: false,
        };
        let json = serde_json::to_string(&OutboundEvent::Status(status)).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""17":{"anchor_id":17,"status":"OK""#));
    }
}
