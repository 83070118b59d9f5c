//! Per-anchor clock correction
//!
//! Every anchor timestamps blinks with its own free-running 40-bit counter.
//! ClockSync keeps one linear model per anchor mapping that counter onto the
//! master anchor's timeline (`reference = a * raw + b`), unwraps counter
//! rollover against arrival time, enforces per-anchor sequence order and
//! tracks how fresh each model is.
//!
//! State is owned by the processor task; nothing here is shared.

use crate::domain::error::ProcessorError;
use crate::domain::types::{AnchorId, SyncState, SyncStatus};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// DW1000 timestamp resolution: 1 / (499.2 MHz * 128)
pub const TICK_SECONDS: f64 = 1.0 / (499.2e6 * 128.0);

/// Raw hardware timestamps wrap at 2^40 ticks (~17.2 s)
pub const TIMESTAMP_MODULUS: u64 = 1 << 40;

/// Half the counter range; a reading is placed on the epoch nearest its prediction
const WRAP_TOLERANCE: u64 = TIMESTAMP_MODULUS / 2;

/// Consecutive, mutually ordered sequence faults taken as a restarted counter
const RESTART_AFTER_FAULTS: u32 = 3;

/// Health thresholds in multiples of the sync interval
const DEGRADED_AFTER_INTERVALS: u32 = 2;
const LOST_AFTER_INTERVALS: u32 = 5;

/// Convert ticks to seconds
#[inline]
pub fn ticks_to_seconds(ticks: f64) -> f64 {
    ticks * TICK_SECONDS
}

/// Convert seconds to ticks
#[inline]
pub fn seconds_to_ticks(seconds: f64) -> f64 {
    seconds / TICK_SECONDS
}

/// Linear map from an anchor's unwrapped ticks to reference ticks
///
/// Replaced whole on every resync, so a reader never sees `a` from one fit
/// paired with `b` from another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockModel {
    pub a: f64,
    pub b: f64,
}

impl ClockModel {
    pub const IDENTITY: ClockModel = ClockModel { a: 1.0, b: 0.0 };

    #[inline]
    pub fn apply(&self, ticks: f64) -> f64 {
        self.a * ticks + self.b
    }

    pub fn drift_ppm(&self) -> f64 {
        (self.a - 1.0) * 1e6
    }
}

/// One paired observation: local unwrapped ticks and reference ticks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    pub raw: f64,
    pub reference: f64,
}

/// Least-squares fit of `reference = a * raw + b`
///
/// Computed on mean-centred data; raw tick counts are ~1e12 and squaring
/// them directly loses most of the mantissa.
pub fn fit_clock_model(anchor_id: AnchorId, samples: &[SyncSample]) -> Result<ClockModel, ProcessorError> {
    let n = samples.len();
    if n < 2 {
        return Err(ProcessorError::InsufficientSyncSamples { anchor_id, required: 2, available: n });
    }

    let mean_raw = samples.iter().map(|s| s.raw).sum::<f64>() / n as f64;
    let mean_ref = samples.iter().map(|s| s.reference).sum::<f64>() / n as f64;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for s in samples {
        let dx = s.raw - mean_raw;
        sxx += dx * dx;
        sxy += dx * (s.reference - mean_ref);
    }

    if sxx <= 0.0 {
        // All samples share one raw time
        return Err(ProcessorError::InsufficientSyncSamples { anchor_id, required: 2, available: 1 });
    }

    let a = sxy / sxx;
    let b = mean_ref - a * mean_raw;
    Ok(ClockModel { a, b })
}

/// Extends a 40-bit counter into a 64-bit one
///
/// The raw value alone is ambiguous once more than half a wrap period
/// (~8.6 s) passes between readings. Each reading is placed on the epoch
/// closest to the previous reading advanced by the elapsed arrival time.
#[derive(Debug, Default, Clone)]
struct TimestampUnwrapper {
    last: Option<(u64, Instant)>,
}

impl TimestampUnwrapper {
    fn unwrap(&mut self, raw: u64, now: Instant) -> u64 {
        let raw = raw % TIMESTAMP_MODULUS;
        let unwrapped = match self.last {
            None => raw,
            Some((last, seen)) => {
                let elapsed = seconds_to_ticks(now.saturating_duration_since(seen).as_secs_f64()) as u64;
                let predicted = last.saturating_add(elapsed);
                let epoch = (predicted + WRAP_TOLERANCE).saturating_sub(raw) / TIMESTAMP_MODULUS;
                epoch * TIMESTAMP_MODULUS + raw
            }
        };
        self.last = Some((unwrapped, now));
        unwrapped
    }
}

#[derive(Debug)]
struct AnchorClock {
    unwrapper: TimestampUnwrapper,
    last_seq: Option<u16>,
    model: Option<ClockModel>,
    /// Last successful resync, or first sighting before any
    last_sync: Instant,
    /// Set by a rejected resync, cleared by the next good one
    fit_failed: bool,
    state: SyncState,
    /// Run of faulting sequence numbers that are ordered among themselves
    fault_run: u32,
    fault_seq: Option<u16>,
    restarts: u64,
}

impl AnchorClock {
    fn new(now: Instant) -> Self {
        Self {
            unwrapper: TimestampUnwrapper::default(),
            last_seq: None,
            model: None,
            last_sync: now,
            fit_failed: false,
            state: SyncState::Degraded,
            fault_run: 0,
            fault_seq: None,
            restarts: 0,
        }
    }

    /// Accept the next blink sequence number
    ///
    /// Returns `Ok(true)` when the anchor's counter has restarted: a run of
    /// faults that keep advancing among themselves, as after a reboot. The
    /// restart drops everything tied to the old counter.
    fn accept_seq(&mut self, anchor_id: AnchorId, seq: u16) -> Result<bool, ProcessorError> {
        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            return Ok(false);
        };

        // 16-bit serial number arithmetic
        if (seq.wrapping_sub(last) as i16) > 0 {
            self.last_seq = Some(seq);
            self.fault_run = 0;
            self.fault_seq = None;
            return Ok(false);
        }

        let advancing = self.fault_seq.is_some_and(|prev| (seq.wrapping_sub(prev) as i16) > 0);
        self.fault_run = if advancing { self.fault_run + 1 } else { 1 };
        self.fault_seq = Some(seq);
        if self.fault_run < RESTART_AFTER_FAULTS {
            return Err(ProcessorError::SequenceFault { anchor_id, last: last as u32, got: seq as u32 });
        }

        warn!(anchor = %anchor_id, last = %last, seq = %seq, "anchor_sequence_restart");
        self.last_seq = Some(seq);
        self.fault_run = 0;
        self.fault_seq = None;
        self.unwrapper = TimestampUnwrapper::default();
        self.model = None;
        self.fit_failed = false;
        self.restarts += 1;
        Ok(true)
    }
}

/// Clock correction for every anchor on the bus
pub struct ClockSync {
    master: AnchorId,
    sync_interval: Duration,
    anchors: FxHashMap<AnchorId, AnchorClock>,
    /// Only pre-registered anchors are tracked
    registered: bool,
}

impl ClockSync {
    pub fn new(master: AnchorId, sync_interval: Duration) -> Self {
        Self { master, sync_interval, anchors: FxHashMap::default(), registered: false }
    }

    /// Register the anchor set up front
    ///
    /// Registered anchors show up in status before their first frame, and
    /// frames from any other anchor id are rejected with `UnknownAnchor`.
    pub fn with_anchors(mut self, anchors: impl IntoIterator<Item = AnchorId>, now: Instant) -> Self {
        for id in anchors {
            self.anchors.entry(id).or_insert_with(|| AnchorClock::new(now));
        }
        self.registered = true;
        self
    }

    pub fn master(&self) -> AnchorId {
        self.master
    }

    fn clock_mut(&mut self, anchor_id: AnchorId, now: Instant) -> Result<&mut AnchorClock, ProcessorError> {
        if self.registered {
            return self.anchors.get_mut(&anchor_id).ok_or(ProcessorError::UnknownAnchor(anchor_id));
        }
        Ok(self.anchors.entry(anchor_id).or_insert_with(|| AnchorClock::new(now)))
    }

    /// Correct one blink timestamp onto the reference timeline (seconds)
    ///
    /// Rejects duplicate or out-of-order sequence numbers, until a run of
    /// them shows the anchor's counter restarted. Anchors without a model
    /// pass the unwrapped raw time through and stay DEGRADED.
    pub fn ingest(
        &mut self,
        anchor_id: AnchorId,
        seq_num: u16,
        raw_timestamp: u64,
        now: Instant,
    ) -> Result<f64, ProcessorError> {
        let is_master = anchor_id == self.master;
        let clock = self.clock_mut(anchor_id, now)?;
        let restarted = clock.accept_seq(anchor_id, seq_num)?;
        let unwrapped = clock.unwrapper.unwrap(raw_timestamp, now) as f64;
        let model = clock.model;

        if is_master {
            if restarted {
                // Every slave model maps onto the old master counter
                for clock in self.anchors.values_mut() {
                    clock.model = None;
                }
            }
            return Ok(ticks_to_seconds(unwrapped));
        }

        let reference = match model {
            Some(model) => model.apply(unwrapped),
            None => unwrapped,
        };
        Ok(ticks_to_seconds(reference))
    }

    /// Unwrap a sync-frame timestamp on the anchor's own timeline (ticks)
    ///
    /// Sync frames carry no blink sequence number; they share the anchor's
    /// unwrapper so blink and sync times stay on one axis.
    pub fn unwrap_sync(&mut self, anchor_id: AnchorId, raw_timestamp: u64, now: Instant) -> Result<u64, ProcessorError> {
        Ok(self.clock_mut(anchor_id, now)?.unwrapper.unwrap(raw_timestamp, now))
    }

    /// How many times an anchor's sequence counter has restarted
    pub fn restarts(&self, anchor_id: AnchorId) -> u64 {
        self.anchors.get(&anchor_id).map_or(0, |c| c.restarts)
    }

    /// Refit an anchor's model from paired samples
    ///
    /// On failure the previous model is kept and the anchor is DEGRADED.
    pub fn resync(
        &mut self,
        anchor_id: AnchorId,
        samples: &[SyncSample],
        now: Instant,
    ) -> Result<ClockModel, ProcessorError> {
        if anchor_id == self.master {
            return Ok(ClockModel::IDENTITY);
        }

        let clock = self.clock_mut(anchor_id, now)?;
        match fit_clock_model(anchor_id, samples) {
            Ok(model) => {
                let first = clock.model.is_none();
                clock.model = Some(model);
                clock.last_sync = now;
                clock.fit_failed = false;
                clock.state = SyncState::Ok;
                if first {
                    info!(
                        anchor = %anchor_id,
                        drift_ppm = format!("{:.3}", model.drift_ppm()),
                        samples = %samples.len(),
                        "anchor_clock_synced"
                    );
                } else {
                    debug!(
                        anchor = %anchor_id,
                        a = %model.a,
                        b = %model.b,
                        samples = %samples.len(),
                        "anchor_clock_resynced"
                    );
                }
                Ok(model)
            }
            Err(e) => {
                clock.fit_failed = true;
                if clock.state == SyncState::Ok {
                    clock.state = SyncState::Degraded;
                }
                Err(e)
            }
        }
    }

    fn evaluate(&self, anchor_id: AnchorId, clock: &AnchorClock, now: Instant) -> SyncState {
        if anchor_id == self.master {
            return SyncState::Ok;
        }
        let age = now.saturating_duration_since(clock.last_sync);
        if age > self.sync_interval * LOST_AFTER_INTERVALS {
            SyncState::Lost
        } else if clock.model.is_none()
            || clock.fit_failed
            || age >= self.sync_interval * DEGRADED_AFTER_INTERVALS
        {
            SyncState::Degraded
        } else {
            SyncState::Ok
        }
    }

    /// Health of one anchor at `now`
    pub fn state(&self, anchor_id: AnchorId, now: Instant) -> SyncState {
        match self.anchors.get(&anchor_id) {
            Some(clock) => self.evaluate(anchor_id, clock, now),
            None if anchor_id == self.master => SyncState::Ok,
            None => SyncState::Degraded,
        }
    }

    /// Re-evaluate every anchor, returning the ones that just became LOST
    pub fn refresh_health(&mut self, now: Instant) -> Vec<ProcessorError> {
        let mut lost = Vec::new();
        let states: Vec<(AnchorId, SyncState)> = self
            .anchors
            .iter()
            .map(|(id, clock)| (*id, self.evaluate(*id, clock, now)))
            .collect();

        for (id, state) in states {
            if let Some(clock) = self.anchors.get_mut(&id) {
                if state == SyncState::Lost && clock.state != SyncState::Lost {
                    let age_ms = now.saturating_duration_since(clock.last_sync).as_millis() as u64;
                    warn!(anchor = %id, age_ms = %age_ms, "anchor_clock_lost");
                    lost.push(ProcessorError::AnchorClockLost { anchor_id: id, age_ms });
                } else if state != SyncState::Lost && clock.state == SyncState::Lost {
                    info!(anchor = %id, state = state.as_str(), "anchor_clock_recovered");
                }
                clock.state = state;
            }
        }
        lost
    }

    /// Current model for an anchor (master is always identity)
    pub fn model(&self, anchor_id: AnchorId) -> Option<ClockModel> {
        if anchor_id == self.master {
            return Some(ClockModel::IDENTITY);
        }
        self.anchors.get(&anchor_id).and_then(|c| c.model)
    }

    pub fn status(&self, anchor_id: AnchorId, now: Instant) -> Option<SyncStatus> {
        let clock = self.anchors.get(&anchor_id)?;
        let model = self.model(anchor_id).unwrap_or(ClockModel::IDENTITY);
        let last_sync_age_ms = if anchor_id == self.master {
            0
        } else {
            now.saturating_duration_since(clock.last_sync).as_millis() as u64
        };
        Some(SyncStatus {
            anchor_id,
            status: self.evaluate(anchor_id, clock, now),
            drift_ppm: model.drift_ppm(),
            last_sync_age_ms,
            a: model.a,
            b: model.b,
        })
    }

    /// Snapshot of every known anchor, keyed and ordered by id
    pub fn snapshot(&self, now: Instant) -> BTreeMap<AnchorId, SyncStatus> {
        self.anchors
            .keys()
            .filter_map(|id| self.status(*id, now).map(|s| (*id, s)))
            .collect()
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }
}
