//! Processing pipeline
//!
//! The Processor is the single consumer of the inbound queue and owns all
//! per-anchor and per-tag state. It routes:
//! - blinks through clock correction, correlation, geometry and decisions
//! - sync observations through pairing into clock resyncs
//! - anchor self-reports into logs
//!
//! Decisions and periodic status snapshots go to the outbound queue.

use crate::domain::error::ProcessorError;
use crate::domain::types::{
    epoch_ms, AnchorId, AnchorReport, AnchorReportedStatus, BlinkEvent, CollectorMessage, Decision, SyncObservation,
    SyncState, SystemStatus, TagId,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::queue::OutboundSender;
use crate::services::clock_sync::ClockSync;
use crate::services::correlator::{BlinkGroup, Correlator};
use crate::services::decision::{DecisionConfig, DecisionEngine};
use crate::services::geometry::GeometryEngine;
use crate::services::sync_correlator::SyncCorrelator;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reported vs. locally fitted drift beyond this is worth a log line
const DRIFT_MISMATCH_PPM: f64 = 5.0;

/// Process-wide totals threaded through the pipeline
#[derive(Debug)]
pub struct ProcessContext {
    pub started_at: Instant,
    pub total_blinks: u64,
    pub total_decisions: u64,
    pub tags_seen: BTreeSet<TagId>,
    pub dropped_no_fix: u64,
    pub sequence_faults: u64,
    pub outbound_dropped: u64,
    /// Outbound drops not yet reflected in a published status
    pub dropped_since_status: u64,
}

impl ProcessContext {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            total_blinks: 0,
            total_decisions: 0,
            tags_seen: BTreeSet::new(),
            dropped_no_fix: 0,
            sequence_faults: 0,
            outbound_dropped: 0,
            dropped_since_status: 0,
        }
    }
}

pub struct Processor {
    clock_sync: ClockSync,
    sync_correlator: SyncCorrelator,
    correlator: Correlator,
    geometry: GeometryEngine,
    decisions: DecisionEngine,
    metrics: Arc<Metrics>,
    context: ProcessContext,
    outbound: OutboundSender,
    reported: FxHashMap<AnchorId, AnchorReportedStatus>,
    poll_interval: Duration,
    status_interval: Duration,
}

impl Processor {
    /// Build the pipeline from validated configuration
    pub fn new(config: &Config, metrics: Arc<Metrics>, outbound: OutboundSender) -> Result<Self, ProcessorError> {
        let now = Instant::now();
        let plane = config.plane()?;
        let anchors = config.anchors();

        let clock_sync = ClockSync::new(config.master_anchor_id(), Duration::from_millis(config.sync_interval_ms()))
            .with_anchors(anchors.iter().map(|a| a.anchor_id), now);
        let sync_correlator =
            SyncCorrelator::new(config.master_anchor_id(), anchors, config.sync_sample_window());
        let geometry = GeometryEngine::new(plane, config.dead_zone_m(), config.min_anchors(), anchors)
            .with_metrics(metrics.clone());
        let correlator = Correlator::new(config.correlation_window_us(), geometry.min_anchors(), anchors.len());
        let decisions = DecisionEngine::new(DecisionConfig::from_config(config));

        let window = Duration::from_millis(config.decision_window_ms());
        let poll_interval = (window / 2).min(Duration::from_millis(100)).max(Duration::from_millis(1));

        Ok(Self {
            clock_sync,
            sync_correlator,
            correlator,
            geometry,
            decisions,
            metrics,
            context: ProcessContext::new(now),
            outbound,
            reported: FxHashMap::default(),
            poll_interval,
            status_interval: Duration::from_millis(config.status_interval_ms().max(1)),
        })
    }

    /// Consume the inbound queue until it closes or shutdown is signalled
    pub async fn run(mut self, mut inbound: mpsc::Receiver<CollectorMessage>, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_interval = interval(self.status_interval);
        status_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_ms = %self.poll_interval.as_millis(),
            status_ms = %self.status_interval.as_millis(),
            anchors = %self.clock_sync.anchor_count(),
            "processor_started"
        );

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(m) => self.handle(m).await,
                        None => {
                            info!("inbound_queue_closed");
                            break;
                        }
                    }
                }
                _ = poll_interval.tick() => {
                    self.poll(Instant::now()).await;
                }
                _ = status_interval.tick() => {
                    self.publish_status(Instant::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("processor_shutdown_requested");
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Handle one inbound message
    pub async fn handle(&mut self, message: CollectorMessage) {
        let now = Instant::now();
        match message {
            CollectorMessage::Blink(blink) => {
                let decisions = self.process_blink(blink, now);
                self.publish_decisions(decisions).await;
            }
            CollectorMessage::Sync(observation) => self.process_sync(observation, now),
            CollectorMessage::AnchorReport(report) => self.process_report(report, now),
        }
    }

    fn count_dropped(&mut self, count: usize) {
        if count > 0 {
            self.context.dropped_no_fix += count as u64;
            self.metrics.record_dropped_no_fix(count as u64);
        }
    }

    fn process_blink(&mut self, mut blink: BlinkEvent, now: Instant) -> Vec<Decision> {
        self.context.total_blinks += 1;
        self.context.tags_seen.insert(blink.tag_id);

        // Another pylon's anchors share the bus; they must not get clock state here
        if !self.geometry.knows_anchor(blink.anchor_id) {
            self.metrics.record_unknown_anchor();
            self.count_dropped(1);
            debug!(error = %ProcessorError::UnknownAnchor(blink.anchor_id), "blink_rejected");
            return Vec::new();
        }

        let restarts = self.clock_sync.restarts(blink.anchor_id);
        let corrected = match self.clock_sync.ingest(blink.anchor_id, blink.seq_num, blink.timestamp_raw, now) {
            Ok(t) => t,
            Err(e) => {
                self.context.sequence_faults += 1;
                self.metrics.record_sequence_fault();
                debug!(tag = %blink.tag_id, error = %e, "blink_rejected");
                return Vec::new();
            }
        };
        if self.clock_sync.restarts(blink.anchor_id) != restarts {
            self.on_anchor_restart(blink.anchor_id);
        }

        blink.timestamp_corrected = corrected;
        let latency_us = now.saturating_duration_since(blink.received_at).as_micros() as u64;
        self.metrics.record_blink_processed(latency_us);

        let tag_id = blink.tag_id;
        let correlated = self.correlator.push(blink);
        self.count_dropped(correlated.dropped);

        match correlated.ready {
            Some(group) => self.classify_group(tag_id, &group, now),
            None => Vec::new(),
        }
    }

    fn classify_group(&mut self, tag_id: TagId, group: &BlinkGroup, now: Instant) -> Vec<Decision> {
        let clock_sync = &self.clock_sync;
        match self.geometry.classify(tag_id, group, |id| clock_sync.state(id, now)) {
            Ok(event) => self.decisions.on_event(&event, now),
            Err(e) => {
                self.count_dropped(group.len());
                debug!(tag = %tag_id, error = %e, "no_fix");
                Vec::new()
            }
        }
    }

    /// Sync pairs taken against an old counter would poison the next fit
    fn on_anchor_restart(&mut self, anchor_id: AnchorId) {
        self.metrics.record_anchor_restart();
        if anchor_id == self.clock_sync.master() {
            self.sync_correlator.reset();
        } else {
            self.sync_correlator.forget(anchor_id);
        }
    }

    fn process_sync(&mut self, observation: SyncObservation, now: Instant) {
        self.metrics.record_sync_observation();
        if !self.geometry.knows_anchor(observation.anchor_id) {
            debug!(error = %ProcessorError::UnknownAnchor(observation.anchor_id), "sync_rejected");
            return;
        }
        let ticks = match self.clock_sync.unwrap_sync(observation.anchor_id, observation.timestamp_raw, now) {
            Ok(ticks) => ticks,
            Err(e) => {
                debug!(error = %e, "sync_rejected");
                return;
            }
        };
        let updated = self.sync_correlator.observe(observation.anchor_id, observation.sync_count, ticks);

        for anchor_id in updated {
            let samples = self.sync_correlator.samples(anchor_id);
            match self.clock_sync.resync(anchor_id, &samples, now) {
                Ok(_) => self.metrics.record_resync(true),
                Err(e) => {
                    self.metrics.record_resync(false);
                    debug!(error = %e, "resync_skipped");
                }
            }
        }
    }

    fn process_report(&mut self, report: AnchorReport, now: Instant) {
        let previous = self.reported.insert(report.anchor_id, report.status);
        if previous != Some(report.status) {
            let local = self.clock_sync.state(report.anchor_id, now);
            if report.status == AnchorReportedStatus::Ok {
                info!(
                    anchor = %report.anchor_id,
                    reported = report.status.as_str(),
                    local = local.as_str(),
                    "anchor_reported_status"
                );
            } else {
                warn!(
                    anchor = %report.anchor_id,
                    reported = report.status.as_str(),
                    local = local.as_str(),
                    last_sync_age_ms = %report.last_sync_age_ms,
                    "anchor_reported_fault"
                );
            }
        }

        if let Some(status) = self.clock_sync.status(report.anchor_id, now) {
            let has_model = self.clock_sync.model(report.anchor_id).is_some();
            let mismatch = (status.drift_ppm - report.drift_ppm as f64).abs();
            if has_model && status.status == SyncState::Ok && mismatch > DRIFT_MISMATCH_PPM {
                debug!(
                    anchor = %report.anchor_id,
                    reported_ppm = %report.drift_ppm,
                    local_ppm = format!("{:.2}", status.drift_ppm),
                    "anchor_drift_mismatch"
                );
            }
        }
    }

    /// Settle stale clusters, close expired windows and re-evaluate anchor health
    pub async fn poll(&mut self, now: Instant) {
        let flushed = self.correlator.flush_stale(now);
        self.count_dropped(flushed.dropped);
        let mut decisions = Vec::new();
        for group in &flushed.ready {
            if let Some(tag_id) = group.first().map(|b| b.tag_id) {
                decisions.extend(self.classify_group(tag_id, group, now));
            }
        }
        decisions.extend(self.decisions.poll_expired(now));
        self.publish_decisions(decisions).await;

        for _lost in self.clock_sync.refresh_health(now) {
            self.metrics.record_anchor_clock_lost();
        }
        self.metrics.set_open_windows(self.decisions.open_windows() as u64);
    }

    async fn publish_decisions(&mut self, decisions: Vec<Decision>) {
        for decision in decisions {
            self.context.total_decisions += 1;
            self.metrics.record_decision(decision.result);
            let tag_id = decision.tag_id;
            if let Err(e) = self.outbound.send_decision(decision).await {
                self.record_outbound_drop();
                warn!(tag = %tag_id, error = %e, "decision_dropped");
            }
        }
    }

    fn record_outbound_drop(&mut self) {
        self.context.outbound_dropped += 1;
        self.context.dropped_since_status += 1;
        self.metrics.record_outbound_dropped();
    }

    /// Snapshot of the whole pipeline
    pub fn status(&self, now: Instant) -> SystemStatus {
        let anchors = self.clock_sync.snapshot(now);
        let any_lost = anchors.values().any(|s| s.status == SyncState::Lost);
        SystemStatus {
            ts: epoch_ms(),
            anchors,
            tags_seen: self.context.tags_seen.clone(),
            total_blinks: self.context.total_blinks,
            total_decisions: self.context.total_decisions,
            uptime_seconds: now.saturating_duration_since(self.context.started_at).as_secs_f64(),
            dropped_no_fix: self.context.dropped_no_fix,
            sequence_faults: self.context.sequence_faults,
            outbound_dropped: self.context.outbound_dropped,
            open_windows: self.decisions.open_windows(),
            degraded: any_lost || self.context.dropped_since_status > 0,
        }
    }

    fn publish_status(&mut self, now: Instant) {
        let status = self.status(now);
        match self.outbound.send_status(status) {
            Ok(()) => self.context.dropped_since_status = 0,
            Err(e) => {
                self.record_outbound_drop();
                debug!(error = %e, "status_dropped");
            }
        }
    }

    /// Drain open windows and publish a final status
    async fn finish(&mut self) {
        let decisions = self.decisions.drain();
        let closed = decisions.len();
        self.publish_decisions(decisions).await;

        let unfixed = self.correlator.drain();
        self.count_dropped(unfixed);

        self.publish_status(Instant::now());
        info!(
            closed_windows = %closed,
            total_blinks = %self.context.total_blinks,
            total_decisions = %self.context.total_decisions,
            "processor_stopped"
        );
    }

    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    pub fn open_windows(&self) -> usize {
        self.decisions.open_windows()
    }
}
