//! Synthetic anchor bus for `--simulate`
//!
//! Builds a deterministic scenario from the configured anchors and plane:
//! - every slave clock runs with its own drift and offset
//! - the master broadcasts sync every `sync_interval_ms` for the whole run
//! - one tag flies a straight line through the plane, blinking at a fixed rate
//! - every anchor sends a status frame once per second
//!
//! Frames are encoded to wire bytes and decoded again before they reach the
//! inbound queue, so the simulator exercises the same path as the RS485
//! collector.

use crate::domain::error::ProcessorError;
use crate::domain::geometry::{AnchorPosition, Plane, Vec3, C_AIR};
use crate::domain::types::{AnchorId, Side, TagId};
use crate::infra::config::{Config, CrossingDirection};
use crate::infra::metrics::Metrics;
use crate::io::frame::{Frame, FrameDecoder};
use crate::io::queue::BlinkQueue;
use crate::services::clock_sync::{seconds_to_ticks, TIMESTAMP_MODULUS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Scenario knobs; the defaults give a racing-speed pass
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub tag_id: TagId,
    pub speed_mps: f64,
    pub blink_hz: f64,
    /// Distance from the plane where the pass starts and ends
    pub half_length_m: f64,
    /// Sync rounds before the tag starts moving
    pub lead_syncs: u32,
    /// Quiet time after the pass, still with sync traffic
    pub tail: Duration,
    /// Crossing point relative to the pylon point (the normal component is ignored)
    pub offset: [f64; 3],
    /// Playback speed for `run`; 1.0 is real time
    pub time_scale: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tag_id: TagId(0x0001),
            speed_mps: 30.0,
            blink_hz: 30.0,
            half_length_m: 10.0,
            lead_syncs: 4,
            tail: Duration::from_secs(1),
            offset: [0.0, 1.0, 2.0],
            time_scale: 1.0,
        }
    }
}

/// A frame and the scenario time at which it goes on the wire
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    pub at: Duration,
    pub frame: Frame,
}

#[derive(Debug, Clone, Copy)]
struct SimAnchor {
    anchor: AnchorPosition,
    drift_ppm: f64,
    offset_s: f64,
}

impl SimAnchor {
    /// Raw 40-bit timestamp of true time `t` on this anchor's clock
    fn ticks(&self, t: f64) -> u64 {
        let local = (t + self.offset_s) * (1.0 + self.drift_ppm * 1e-6);
        (seconds_to_ticks(local).round() as u64) % TIMESTAMP_MODULUS
    }
}

pub struct Simulator {
    master: AnchorPosition,
    slaves: Vec<SimAnchor>,
    plane: Plane,
    direction: CrossingDirection,
    sync_interval: Duration,
    sim: SimulatorConfig,
}

impl Simulator {
    pub fn from_config(config: &Config, sim: SimulatorConfig) -> Result<Self, ProcessorError> {
        let plane = config.plane()?;
        let master_id = config.master_anchor_id();
        let master = config
            .anchors()
            .iter()
            .find(|a| a.anchor_id == master_id)
            .copied()
            .ok_or(ProcessorError::UnknownAnchor(master_id))?;

        // Drift in [-5, 5] ppm and offsets of a few ms, fixed per slot
        let slaves = config
            .anchors()
            .iter()
            .filter(|a| a.anchor_id != master_id)
            .enumerate()
            .map(|(i, anchor)| SimAnchor {
                anchor: *anchor,
                drift_ppm: ((i as f64 * 7.0 + 3.0) % 11.0) - 5.0,
                offset_s: 0.004 * (i as f64 + 1.0),
            })
            .collect();

        Ok(Self {
            master,
            slaves,
            plane,
            direction: config.expected_direction(),
            sync_interval: Duration::from_millis(config.sync_interval_ms()),
            sim,
        })
    }

    /// Start and end of the pass, crossing the plane in the expected direction
    fn path(&self) -> (Vec3, Vec3) {
        let normal = *self.plane.normal();
        let offset = Vec3::from(self.sim.offset);
        let crossing = self.plane.point() + offset - normal * offset.dot(&normal);
        let start_sign = match self.direction.from_side() {
            Side::Interior => -1.0,
            _ => 1.0,
        };
        let start = crossing + normal * (start_sign * self.sim.half_length_m);
        let end = crossing - normal * (start_sign * self.sim.half_length_m);
        (start, end)
    }

    /// Total scenario length
    pub fn duration(&self) -> Duration {
        self.pass_start() + Duration::from_secs_f64(self.pass_seconds()) + self.sim.tail
    }

    fn pass_start(&self) -> Duration {
        self.sync_interval * self.sim.lead_syncs.max(2)
    }

    fn pass_seconds(&self) -> f64 {
        2.0 * self.sim.half_length_m / self.sim.speed_mps.max(f64::EPSILON)
    }

    fn drift_of(&self, anchor_id: AnchorId) -> f64 {
        self.slaves.iter().find(|s| s.anchor.anchor_id == anchor_id).map_or(0.0, |s| s.drift_ppm)
    }

    /// Every frame of the scenario in wire order
    pub fn generate(&self) -> Vec<ScheduledFrame> {
        let mut frames = Vec::new();
        let total = self.duration().as_secs_f64();
        let master_clock = SimAnchor { anchor: self.master, drift_ppm: 0.0, offset_s: 0.0 };

        // Sync rounds
        let interval = self.sync_interval.as_secs_f64().max(0.001);
        let mut count = 1u32;
        while count as f64 * interval <= total {
            let tx = count as f64 * interval;
            frames.push((tx, Frame::Sync { anchor_id: self.master.anchor_id, sync_count: count, timestamp: master_clock.ticks(tx) }));
            for slave in &self.slaves {
                let arrival = tx + (slave.anchor.position - self.master.position).norm() / C_AIR;
                frames.push((
                    arrival,
                    Frame::Sync { anchor_id: slave.anchor.anchor_id, sync_count: count, timestamp: slave.ticks(arrival) },
                ));
            }
            count += 1;
        }

        // Anchor self-reports
        let mut second = 1.0;
        while second <= total {
            let since_sync = (second % interval) * 1000.0;
            for anchor in std::iter::once(&self.master).chain(self.slaves.iter().map(|s| &s.anchor)) {
                frames.push((
                    second,
                    Frame::Status {
                        anchor_id: anchor.anchor_id,
                        status: 0,
                        drift_ppm: self.drift_of(anchor.anchor_id).round() as i16,
                        last_sync_age_ms: since_sync as u16,
                    },
                ));
            }
            second += 1.0;
        }

        // The pass
        let (start, end) = self.path();
        let direction = (end - start).normalize();
        let pass_start = self.pass_start().as_secs_f64();
        let blinks = (self.pass_seconds() * self.sim.blink_hz).round() as u32;
        let mut seq = 0u16;
        for k in 0..=blinks {
            let elapsed = k as f64 / self.sim.blink_hz;
            let t = pass_start + elapsed;
            let position = start + direction * (self.sim.speed_mps * elapsed);
            seq = seq.wrapping_add(1);
            for clock in std::iter::once(&master_clock).chain(self.slaves.iter()) {
                let arrival = t + (position - clock.anchor.position).norm() / C_AIR;
                frames.push((
                    arrival,
                    Frame::Blink {
                        anchor_id: clock.anchor.anchor_id,
                        tag_id: self.sim.tag_id,
                        seq_num: seq,
                        timestamp: clock.ticks(arrival),
                        rssi: -60,
                    },
                ));
            }
        }

        frames.sort_by(|a, b| a.0.total_cmp(&b.0));
        frames.into_iter().map(|(at, frame)| ScheduledFrame { at: Duration::from_secs_f64(at), frame }).collect()
    }

    /// Play the scenario into the inbound queue, paced by `time_scale`
    pub async fn run(self, queue: BlinkQueue, metrics: Arc<Metrics>, mut shutdown: watch::Receiver<bool>) {
        let frames = self.generate();
        let scale = if self.sim.time_scale > 0.0 { self.sim.time_scale } else { 1.0 };
        info!(
            frames = %frames.len(),
            slaves = %self.slaves.len(),
            tag = %self.sim.tag_id,
            duration_ms = %self.duration().as_millis(),
            "simulator_started"
        );
        for slave in &self.slaves {
            debug!(anchor = %slave.anchor.anchor_id, drift_ppm = %slave.drift_ppm, offset_s = %slave.offset_s, "simulated_anchor");
        }

        let mut decoder = FrameDecoder::new();
        let started = tokio::time::Instant::now();
        for scheduled in frames {
            let due = started + scheduled.at.div_f64(scale);
            tokio::select! {
                _ = tokio::time::sleep_until(due) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("simulator_shutdown");
                        return;
                    }
                }
            }

            let received_at = Instant::now();
            for frame in decoder.decode(&scheduled.frame.encode()) {
                metrics.record_frame_decoded();
                if let Err(e) = queue.push(frame.into_message(received_at)).await {
                    if queue.is_closed() {
                        info!("simulator_queue_closed");
                        return;
                    }
                    warn!(error = %e, "simulator_frame_dropped");
                }
            }
        }
        info!(frames = %decoder.frames(), "simulator_finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CollectorMessage;
    use crate::io::queue::create_blink_queue;

    const ANCHORS: [(u8, [f64; 3]); 5] = [
        (0x11, [0.0, -10.0, 0.5]),
        (0x12, [0.0, 10.0, 0.5]),
        (0x13, [-15.0, 0.0, 6.0]),
        (0x14, [15.0, 0.0, 3.0]),
        (0x15, [5.0, 5.0, 8.0]),
    ];

    fn simulator(sim: SimulatorConfig) -> Simulator {
        let config = Config::default().with_geometry([0.0; 3], [1.0, 0.0, 0.0], &ANCHORS).with_master_anchor(0x11);
        Simulator::from_config(&config, sim).unwrap()
    }

    #[test]
    fn test_scenario_is_ordered_and_deterministic() {
        let sim = simulator(SimulatorConfig::default());
        let a = sim.generate();
        let b = sim.generate();
        assert_eq!(a.len(), b.len());
        assert!(a.windows(2).all(|w| w[0].at <= w[1].at));
        assert!(a.iter().zip(&b).all(|(x, y)| x.frame == y.frame));
    }

    #[test]
    fn test_every_anchor_sees_every_blink() {
        let sim = simulator(SimulatorConfig::default());
        let frames = sim.generate();
        let blinks: Vec<_> = frames.iter().filter(|f| matches!(f.frame, Frame::Blink { .. })).collect();
        // 20 m at 30 m/s and 30 Hz
        assert_eq!(blinks.len(), 21 * ANCHORS.len());

        let first_pass = sim.pass_start();
        assert!(blinks.iter().all(|f| f.at >= first_pass));
    }

    #[test]
    fn test_sync_rounds_cover_whole_run() {
        let sim = simulator(SimulatorConfig::default());
        let frames = sim.generate();
        let master_syncs: Vec<u32> = frames
            .iter()
            .filter_map(|f| match f.frame {
                Frame::Sync { anchor_id: AnchorId(0x11), sync_count, .. } => Some(sync_count),
                _ => None,
            })
            .collect();
        let rounds = (sim.duration().as_millis() / 500) as usize;
        assert_eq!(master_syncs.len(), rounds);
        assert_eq!(master_syncs[0], 1);
        let slave_syncs = frames.iter().filter(|f| matches!(f.frame, Frame::Sync { .. })).count() - rounds;
        assert_eq!(slave_syncs, rounds * 4);
    }

    #[test]
    fn test_pass_starts_on_expected_side() {
        let sim = simulator(SimulatorConfig::default());
        let (start, end) = sim.path();
        assert!(sim.plane.signed_distance(&start) > 0.0);
        assert!(sim.plane.signed_distance(&end) < 0.0);
    }

    #[test]
    fn test_missing_master_rejected() {
        let config = Config::default().with_geometry([0.0; 3], [1.0, 0.0, 0.0], &ANCHORS[1..]).with_master_anchor(0x11);
        assert!(Simulator::from_config(&config, SimulatorConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_run_pushes_decoded_frames() {
        let sim = simulator(SimulatorConfig {
            half_length_m: 1.0,
            lead_syncs: 2,
            tail: Duration::ZERO,
            time_scale: 50.0,
            ..SimulatorConfig::default()
        });
        let expected = sim.generate().len();
        let metrics = Arc::new(Metrics::new());
        let (queue, mut rx) = create_blink_queue(expected + 1, Duration::from_millis(10), metrics.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        sim.run(queue, metrics, shutdown_rx).await;

        let mut blinks = 0;
        let mut total = 0;
        while let Ok(message) = rx.try_recv() {
            total += 1;
            if let CollectorMessage::Blink(b) = message {
                assert_eq!(b.tag_id, TagId(0x0001));
                blinks += 1;
            }
        }
        assert_eq!(total, expected);
        assert!(blinks > 0);
    }
}
