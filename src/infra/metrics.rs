//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::DecisionResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Fix uncertainty bucket boundaries (centimeters)
/// Buckets: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560 cm
const UNCERTAINTY_BOUNDS: [u64; 10] = [5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560];

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn uncertainty_bucket_index(uncertainty_cm: u64) -> usize {
    UNCERTAINTY_BOUNDS.partition_point(|&bound| bound < uncertainty_cm)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// Shared between the collectors, the processor and the Prometheus endpoint.
pub struct Metrics {
    /// Total blinks processed (monotonic)
    blinks_total: AtomicU64,
    /// Blinks since last report (reset on report)
    blinks_since_report: AtomicU64,
    /// Sum of receive-to-processed latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Blink processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Position fixes produced (monotonic)
    fixes_total: AtomicU64,
    /// Fix uncertainty histogram (centimeters, cumulative)
    uncertainty_buckets: [AtomicU64; NUM_BUCKETS],
    uncertainty_sum_cm: AtomicU64,
    /// Blinks that never became part of a fix (monotonic)
    dropped_no_fix: AtomicU64,
    /// Duplicate or out-of-order sequence numbers (monotonic)
    sequence_faults: AtomicU64,
    /// Blinks from anchors with no configured position (monotonic)
    unknown_anchor_blinks: AtomicU64,
    /// Anchor sequence counters that restarted, e.g. after a reboot (monotonic)
    anchor_restarts: AtomicU64,
    /// Sync observations received (monotonic)
    sync_observations_total: AtomicU64,
    /// Successful clock model fits (monotonic)
    resyncs_total: AtomicU64,
    /// Resync attempts rejected for insufficient samples (monotonic)
    resync_failures: AtomicU64,
    /// Transitions of an anchor into LOST (monotonic)
    anchor_clock_lost_total: AtomicU64,
    /// Decisions by result (monotonic)
    decisions_valid: AtomicU64,
    decisions_penalty: AtomicU64,
    decisions_no_call: AtomicU64,
    /// Inbound messages dropped on push timeout (monotonic)
    inbound_dropped: AtomicU64,
    /// Outbound events dropped on full queue (monotonic)
    outbound_dropped: AtomicU64,
    /// RS485 frames decoded (monotonic)
    frames_decoded: AtomicU64,
    /// RS485 frames rejected on CRC (monotonic)
    frame_crc_errors: AtomicU64,
    /// Current inbound queue depth (updated by sampler)
    inbound_queue_depth: AtomicU64,
    /// Current number of open decision windows
    open_windows: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            blinks_total: AtomicU64::new(0),
            blinks_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fixes_total: AtomicU64::new(0),
            uncertainty_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            uncertainty_sum_cm: AtomicU64::new(0),
            dropped_no_fix: AtomicU64::new(0),
            sequence_faults: AtomicU64::new(0),
            unknown_anchor_blinks: AtomicU64::new(0),
            anchor_restarts: AtomicU64::new(0),
            sync_observations_total: AtomicU64::new(0),
            resyncs_total: AtomicU64::new(0),
            resync_failures: AtomicU64::new(0),
            anchor_clock_lost_total: AtomicU64::new(0),
            decisions_valid: AtomicU64::new(0),
            decisions_penalty: AtomicU64::new(0),
            decisions_no_call: AtomicU64::new(0),
            inbound_dropped: AtomicU64::new(0),
            outbound_dropped: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frame_crc_errors: AtomicU64::new(0),
            inbound_queue_depth: AtomicU64::new(0),
            open_windows: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a blink was processed with given latency (lock-free)
    #[inline]
    pub fn record_blink_processed(&self, latency_us: u64) {
        self.blinks_total.fetch_add(1, Ordering::Relaxed);
        self.blinks_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    /// Record a position fix and its uncertainty in meters
    #[inline]
    pub fn record_fix(&self, uncertainty_m: f64) {
        self.fixes_total.fetch_add(1, Ordering::Relaxed);
        let cm = (uncertainty_m.max(0.0) * 100.0).round() as u64;
        self.uncertainty_buckets[uncertainty_bucket_index(cm)].fetch_add(1, Ordering::Relaxed);
        self.uncertainty_sum_cm.fetch_add(cm, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_no_fix(&self, count: u64) {
        self.dropped_no_fix.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sequence_fault(&self) {
        self.sequence_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_anchor(&self) {
        self.unknown_anchor_blinks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_anchor_restart(&self) {
        self.anchor_restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sync_observation(&self) {
        self.sync_observations_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resync(&self, ok: bool) {
        if ok {
            self.resyncs_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.resync_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_anchor_clock_lost(&self) {
        self.anchor_clock_lost_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decision(&self, result: DecisionResult) {
        let counter = match result {
            DecisionResult::Valid => &self.decisions_valid,
            DecisionResult::Penalty => &self.decisions_penalty,
            DecisionResult::NoCall => &self.decisions_no_call,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_outbound_dropped(&self) {
        self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_crc_error(&self) {
        self.frame_crc_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Set current inbound queue depth (called by sampler)
    #[inline]
    pub fn set_inbound_queue_depth(&self, depth: u64) {
        self.inbound_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_open_windows(&self, count: u64) {
        self.open_windows.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn blinks_total(&self) -> u64 {
        self.blinks_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped_no_fix(&self) -> u64 {
        self.dropped_no_fix.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sequence_faults(&self) -> u64 {
        self.sequence_faults.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn outbound_dropped(&self) -> u64 {
        self.outbound_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frame_crc_errors(&self) -> u64 {
        self.frame_crc_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn anchor_clock_lost_total(&self) -> u64 {
        self.anchor_clock_lost_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let blinks_count = self.blinks_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let blinks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            blinks_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if blinks_count > 0 { latency_sum / blinks_count } else { 0 };

        // Uncertainty histogram is cumulative, not reset
        let uncertainty_buckets = load_buckets(&self.uncertainty_buckets);
        let uncertainty_count: u64 = uncertainty_buckets.iter().sum();
        let uncertainty_sum = self.uncertainty_sum_cm.load(Ordering::Relaxed);
        let uncertainty_avg_cm =
            if uncertainty_count > 0 { uncertainty_sum / uncertainty_count } else { 0 };

        MetricsSummary {
            blinks_total: self.blinks_total.load(Ordering::Relaxed),
            blinks_per_sec,
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            fixes_total: self.fixes_total.load(Ordering::Relaxed),
            uncertainty_buckets,
            uncertainty_avg_cm,
            dropped_no_fix: self.dropped_no_fix.load(Ordering::Relaxed),
            sequence_faults: self.sequence_faults.load(Ordering::Relaxed),
            unknown_anchor_blinks: self.unknown_anchor_blinks.load(Ordering::Relaxed),
            anchor_restarts: self.anchor_restarts.load(Ordering::Relaxed),
            sync_observations_total: self.sync_observations_total.load(Ordering::Relaxed),
            resyncs_total: self.resyncs_total.load(Ordering::Relaxed),
            resync_failures: self.resync_failures.load(Ordering::Relaxed),
            anchor_clock_lost_total: self.anchor_clock_lost_total.load(Ordering::Relaxed),
            decisions_valid: self.decisions_valid.load(Ordering::Relaxed),
            decisions_penalty: self.decisions_penalty.load(Ordering::Relaxed),
            decisions_no_call: self.decisions_no_call.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frame_crc_errors: self.frame_crc_errors.load(Ordering::Relaxed),
            inbound_queue_depth: self.inbound_queue_depth.load(Ordering::Relaxed),
            open_windows: self.open_windows.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for prometheus)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_UNCERTAINTY_BOUNDS: [u64; 10] = UNCERTAINTY_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub blinks_total: u64,
    pub blinks_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    /// Blink latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub fixes_total: u64,
    /// Fix uncertainty histogram buckets (cm)
    pub uncertainty_buckets: [u64; NUM_BUCKETS],
    pub uncertainty_avg_cm: u64,
    pub dropped_no_fix: u64,
    pub sequence_faults: u64,
    pub unknown_anchor_blinks: u64,
    pub anchor_restarts: u64,
    pub sync_observations_total: u64,
    pub resyncs_total: u64,
    pub resync_failures: u64,
    pub anchor_clock_lost_total: u64,
    pub decisions_valid: u64,
    pub decisions_penalty: u64,
    pub decisions_no_call: u64,
    pub inbound_dropped: u64,
    pub outbound_dropped: u64,
    pub frames_decoded: u64,
    pub frame_crc_errors: u64,
    /// Current inbound queue depth (snapshot)
    pub inbound_queue_depth: u64,
    pub open_windows: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            blinks_total = %self.blinks_total,
            blinks_per_sec = format!("{:.1}", self.blinks_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            p99_us = %self.lat_p99_us,
            fixes = %self.fixes_total,
            uncertainty_avg_cm = %self.uncertainty_avg_cm,
            dropped_no_fix = %self.dropped_no_fix,
            seq_faults = %self.sequence_faults,
            anchor_restarts = %self.anchor_restarts,
            resyncs = %self.resyncs_total,
            valid = %self.decisions_valid,
            penalty = %self.decisions_penalty,
            no_call = %self.decisions_no_call,
            open_windows = %self.open_windows,
            inbound_dropped = %self.inbound_dropped,
            outbound_dropped = %self.outbound_dropped,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.blinks_total(), 0);
        assert_eq!(metrics.outbound_dropped(), 0);
    }

    #[test]
    fn test_record_blink() {
        let metrics = Metrics::new();

        metrics.record_blink_processed(100);
        assert_eq!(metrics.blinks_total(), 1);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_blink_processed(200);
        assert_eq!(metrics.blinks_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_blink_processed(100);
        metrics.record_blink_processed(200);
        metrics.record_blink_processed(300);
        metrics.record_decision(DecisionResult::Valid);
        metrics.record_decision(DecisionResult::NoCall);

        let summary = metrics.report();

        assert_eq!(summary.blinks_total, 3);
        assert_eq!(summary.avg_process_latency_us, 200);
        assert_eq!(summary.max_process_latency_us, 300);
        assert_eq!(summary.decisions_valid, 1);
        assert_eq!(summary.decisions_no_call, 1);
        assert_eq!(summary.decisions_penalty, 0);

        // Periodic counters are reset, monotonic ones are not
        assert_eq!(metrics.blinks_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.blinks_total(), 3);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report();
        assert_eq!(summary.blinks_total, 0);
        assert_eq!(summary.avg_process_latency_us, 0);
        assert_eq!(summary.lat_p99_us, 0);
        assert_eq!(summary.uncertainty_avg_cm, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_blink_processed(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.blinks_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_fix_uncertainty_histogram() {
        let metrics = Metrics::new();
        metrics.record_fix(0.03); // 3 cm, bucket 0
        metrics.record_fix(0.15); // 15 cm, bucket 2
        metrics.record_fix(50.0); // overflow

        let summary = metrics.report();
        assert_eq!(summary.fixes_total, 3);
        assert_eq!(summary.uncertainty_buckets[0], 1);
        assert_eq!(summary.uncertainty_buckets[2], 1);
        assert_eq!(summary.uncertainty_buckets[10], 1);
        assert_eq!(summary.uncertainty_avg_cm, (3 + 15 + 5000) / 3);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_blink_processed(150);
        }
        let summary = metrics.report();
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }

    #[test]
    fn test_resync_counters() {
        let metrics = Metrics::new();
        metrics.record_resync(true);
        metrics.record_resync(false);
        metrics.record_resync(true);
        let summary = metrics.report();
        assert_eq!(summary.resyncs_total, 2);
        assert_eq!(summary.resync_failures, 1);
    }
}
