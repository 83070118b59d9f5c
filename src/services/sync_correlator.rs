//! Pairs sync-broadcast observations into clock samples
//!
//! The master anchor reports the transmit time of each numbered sync
//! broadcast; every other anchor reports when it received that broadcast.
//! Matching the two by sync counter, and adding the master→anchor time of
//! flight, gives a `(local ticks, reference ticks)` pair for ClockSync.

use crate::domain::geometry::{AnchorPosition, Vec3, C_AIR};
use crate::domain::types::AnchorId;
use crate::services::clock_sync::{seconds_to_ticks, SyncSample};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;
use tracing::debug;

/// Master broadcasts remembered for late slave observations
const MASTER_HISTORY: usize = 16;
/// Slave observations held while waiting for the master's
const PENDING_PER_ANCHOR: usize = 16;

pub struct SyncCorrelator {
    master: AnchorId,
    /// Master→anchor propagation delay in ticks
    flight_ticks: FxHashMap<AnchorId, f64>,
    master_times: VecDeque<(u32, u64)>,
    pending: FxHashMap<AnchorId, VecDeque<(u32, u64)>>,
    samples: FxHashMap<AnchorId, VecDeque<SyncSample>>,
    window: usize,
}

impl SyncCorrelator {
    pub fn new(master: AnchorId, anchors: &[AnchorPosition], window: usize) -> Self {
        let master_pos: Option<Vec3> =
            anchors.iter().find(|a| a.anchor_id == master).map(|a| a.position);
        let flight_ticks = anchors
            .iter()
            .map(|a| {
                let tof = master_pos
                    .map(|m| seconds_to_ticks((a.position - m).norm() / C_AIR))
                    .unwrap_or(0.0);
                (a.anchor_id, tof)
            })
            .collect();

        Self {
            master,
            flight_ticks,
            master_times: VecDeque::with_capacity(MASTER_HISTORY),
            pending: FxHashMap::default(),
            samples: FxHashMap::default(),
            window: window.max(2),
        }
    }

    /// Record one observation (timestamp already unwrapped)
    ///
    /// Returns the anchors whose sample window gained a pair.
    pub fn observe(&mut self, anchor_id: AnchorId, sync_count: u32, ticks: u64) -> SmallVec<[AnchorId; 4]> {
        let mut updated = SmallVec::new();

        if anchor_id == self.master {
            if self.master_times.len() == MASTER_HISTORY {
                self.master_times.pop_front();
            }
            self.master_times.push_back((sync_count, ticks));

            let mut matched = Vec::new();
            for (id, queue) in self.pending.iter_mut() {
                if let Some(pos) = queue.iter().position(|(count, _)| *count == sync_count) {
                    if let Some((_, local)) = queue.remove(pos) {
                        matched.push((*id, local));
                    }
                }
            }
            for (id, local) in matched {
                self.push_sample(id, local, ticks);
                updated.push(id);
            }
            return updated;
        }

        let master_ticks =
            self.master_times.iter().rev().find(|(count, _)| *count == sync_count).map(|(_, t)| *t);
        match master_ticks {
            Some(master_ticks) => {
                self.push_sample(anchor_id, ticks, master_ticks);
                updated.push(anchor_id);
            }
            None => {
                let queue = self.pending.entry(anchor_id).or_default();
                if queue.len() == PENDING_PER_ANCHOR {
                    queue.pop_front();
                }
                queue.push_back((sync_count, ticks));
            }
        }
        updated
    }

    fn push_sample(&mut self, anchor_id: AnchorId, local: u64, master_ticks: u64) {
        let flight = self.flight_ticks.get(&anchor_id).copied().unwrap_or(0.0);
        let sample = SyncSample { raw: local as f64, reference: master_ticks as f64 + flight };
        let window = self.samples.entry(anchor_id).or_default();
        if window.len() == self.window {
            window.pop_front();
        }
        window.push_back(sample);
        debug!(anchor = %anchor_id, samples = %window.len(), "sync_sample_paired");
    }

    /// Drop everything paired against an anchor's old counter
    pub fn forget(&mut self, anchor_id: AnchorId) {
        self.pending.remove(&anchor_id);
        self.samples.remove(&anchor_id);
    }

    /// Drop all history; the master's counter no longer matches any sample
    pub fn reset(&mut self) {
        self.master_times.clear();
        self.pending.clear();
        self.samples.clear();
    }

    /// Most recent samples for an anchor, oldest first
    pub fn samples(&self, anchor_id: AnchorId) -> Vec<SyncSample> {
        self.samples.get(&anchor_id).map(|w| w.iter().copied().collect()).unwrap_or_default()
    }
}
