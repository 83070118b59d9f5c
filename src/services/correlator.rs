//! Groups blinks of one tag transmission across anchors
//!
//! Each blink reaches every anchor within a few hundred nanoseconds of the
//! others, while a tag blinks every ~33 ms. A per-tag cluster therefore
//! collects blinks whose corrected timestamps lie within the correlation
//! window of the cluster's first one. A cluster is handed to geometry exactly
//! once: as soon as every configured anchor has reported, or with at least
//! `min_anchors` blinks when the tag's next transmission supersedes it or it
//! goes stale.

use crate::domain::types::{BlinkEvent, TagId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Incomplete clusters are settled after this many correlation windows,
/// floored at `MIN_STALE_AFTER` for anchors on slower buses
const STALE_WINDOWS: u64 = 4;
const MIN_STALE_AFTER: Duration = Duration::from_millis(100);

pub type BlinkGroup = SmallVec<[BlinkEvent; 8]>;

#[derive(Debug)]
struct Cluster {
    first_ts: f64,
    /// Arrival of the first blink
    opened_at: Instant,
    blinks: BlinkGroup,
    emitted: bool,
}

impl Cluster {
    fn start(blink: BlinkEvent) -> Self {
        let mut blinks = BlinkGroup::new();
        let first_ts = blink.timestamp_corrected;
        let opened_at = blink.received_at;
        blinks.push(blink);
        Self { first_ts, opened_at, blinks, emitted: false }
    }
}

/// Outcome of feeding one blink to the correlator
#[derive(Debug, Default)]
pub struct Correlated {
    /// A complete transmission ready for classification
    pub ready: Option<BlinkGroup>,
    /// Blinks that will never be part of a fix
    pub dropped: usize,
}

/// Clusters handed over or discarded by `flush_stale`
#[derive(Debug, Default)]
pub struct Flushed {
    pub ready: Vec<BlinkGroup>,
    pub dropped: usize,
}

pub struct Correlator {
    window_s: f64,
    min_anchors: usize,
    /// Every configured anchor; a cluster this large cannot grow
    all_anchors: usize,
    stale_after: Duration,
    pending: FxHashMap<TagId, Cluster>,
}

impl Correlator {
    pub fn new(correlation_window_us: u64, min_anchors: usize, all_anchors: usize) -> Self {
        let min_anchors = min_anchors.max(1);
        Self {
            window_s: correlation_window_us as f64 * 1e-6,
            min_anchors,
            all_anchors: all_anchors.max(min_anchors),
            stale_after: Duration::from_micros(correlation_window_us * STALE_WINDOWS).max(MIN_STALE_AFTER),
            pending: FxHashMap::default(),
        }
    }

    pub fn push(&mut self, blink: BlinkEvent) -> Correlated {
        let tag_id = blink.tag_id;
        let ts = blink.timestamp_corrected;
        let mut out = Correlated::default();

        if let Some(cluster) = self.pending.get_mut(&tag_id) {
            if (ts - cluster.first_ts).abs() <= self.window_s {
                if cluster.emitted {
                    // Late arrival for a transmission already classified
                    return out;
                }
                if cluster.blinks.iter().any(|b| b.anchor_id == blink.anchor_id) {
                    out.dropped = 1;
                    return out;
                }
                cluster.first_ts = cluster.first_ts.min(ts);
                cluster.blinks.push(blink);
                if cluster.blinks.len() >= self.all_anchors {
                    cluster.emitted = true;
                    out.ready = Some(cluster.blinks.clone());
                }
                return out;
            }
        }

        let mut cluster = Cluster::start(blink);
        if self.all_anchors == 1 {
            cluster.emitted = true;
            out.ready = Some(cluster.blinks.clone());
        }
        if let Some(previous) = self.pending.insert(tag_id, cluster) {
            if !previous.emitted {
                if previous.blinks.len() >= self.min_anchors {
                    out.ready = Some(previous.blinks);
                } else {
                    out.dropped = previous.blinks.len();
                }
            }
        }
        out
    }

    /// Settle every cluster opened before `now - stale_after`
    ///
    /// A tag's last transmission has no successor to supersede it, so an
    /// incomplete cluster would otherwise wait forever.
    pub fn flush_stale(&mut self, now: Instant) -> Flushed {
        let stale_after = self.stale_after;
        let min_anchors = self.min_anchors;
        let mut out = Flushed::default();
        self.pending.retain(|_, cluster| {
            if now.saturating_duration_since(cluster.opened_at) < stale_after {
                return true;
            }
            if !cluster.emitted {
                if cluster.blinks.len() >= min_anchors {
                    out.ready.push(std::mem::take(&mut cluster.blinks));
                } else {
                    out.dropped += cluster.blinks.len();
                }
            }
            false
        });
        out
    }

    /// Discard all clusters, returning how many blinks never reached a fix
    pub fn drain(&mut self) -> usize {
        self.pending.drain().filter(|(_, c)| !c.emitted).map(|(_, c)| c.blinks.len()).sum()
    }

    pub fn pending_tags(&self) -> usize {
        self.pending.len()
    }
}
