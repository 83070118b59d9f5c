//! Per-tag crossing decisions
//!
//! Each tag has at most one open window. A window opens on the first
//! qualifying non-dead-zone passage event; that side is the window's origin.
//! It closes early once enough consecutive qualifying blinks land on the far
//! side, or on timeout, and always emits exactly one `Decision`.
//!
//! Precedence when a window closes:
//! 1. reversal after reaching the far side → PENALTY `direction_reversed`
//! 2. full run from the expected side, confident → VALID `crossing_confirmed`
//! 3. full run from the wrong side → PENALTY `wrong_direction`
//! 4. full run, not confident → NO_CALL `low_confidence`
//! 5. crossing started, lingering in the dead zone → PENALTY `dead_zone_linger`
//! 6. crossing started, run too short → NO_CALL `insufficient_blinks`
//! 7. never left the origin side → NO_CALL `no_crossing`

use crate::domain::types::{Decision, DecisionReason, DecisionResult, PassageEvent, Side, TagId};
use crate::infra::config::{Config, CrossingDirection};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Each contradiction scales decision confidence by this factor
const CONTRADICTION_PENALTY: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub pylon_id: u32,
    pub min_consecutive_blinks: u32,
    pub window: Duration,
    pub confidence_threshold: f64,
    pub min_blink_confidence: f64,
    pub expected_direction: CrossingDirection,
}

impl DecisionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pylon_id: config.pylon_id(),
            min_consecutive_blinks: config.min_consecutive_blinks().max(1),
            window: Duration::from_millis(config.decision_window_ms()),
            confidence_threshold: config.confidence_threshold(),
            min_blink_confidence: config.min_blink_confidence(),
            expected_direction: config.expected_direction(),
        }
    }
}

/// Evidence accumulated for one tag
#[derive(Debug, Clone)]
struct Window {
    origin: Side,
    /// Reference-timeline start, slides while the tag stays on the origin side
    first_ts: f64,
    /// Wall-clock start, slides with `first_ts`
    opened_at: Instant,
    last_ts: f64,
    events: u32,
    crossing_started: bool,
    /// Last qualifying side seen, for reversal detection
    last_side: Side,
    reached_destination: bool,
    run: u32,
    run_confidence: f64,
    qualifying: u32,
    qualifying_confidence: f64,
    reversals: u32,
    low_confidence: u32,
    dead_zone: u32,
}

impl Window {
    fn open(event: &PassageEvent, now: Instant) -> Self {
        Self {
            origin: event.side,
            first_ts: event.timestamp,
            opened_at: now,
            last_ts: event.timestamp,
            events: 1,
            crossing_started: false,
            last_side: event.side,
            reached_destination: false,
            run: 0,
            run_confidence: 0.0,
            qualifying: 1,
            qualifying_confidence: event.confidence,
            reversals: 0,
            low_confidence: 0,
            dead_zone: 0,
        }
    }

    fn destination(&self) -> Side {
        self.origin.opposite()
    }

    fn contradictions(&self) -> u32 {
        self.reversals + self.low_confidence
    }

    fn confidence(&self) -> f64 {
        let base = if self.run > 0 {
            self.run_confidence / self.run as f64
        } else if self.qualifying > 0 {
            self.qualifying_confidence / self.qualifying as f64
        } else {
            0.0
        };
        base * CONTRADICTION_PENALTY.powi(self.contradictions() as i32)
    }

    fn reset_run(&mut self) {
        self.run = 0;
        self.run_confidence = 0.0;
    }
}

/// Tag that just got a completed crossing; it keeps blinking on the far
/// side and those blinks must not open a fresh window
#[derive(Debug, Clone, Copy)]
struct Settled {
    side: Side,
    last_ts: f64,
}

#[derive(Debug, Default)]
struct TagState {
    window: Option<Window>,
    settled: Option<Settled>,
}

pub struct DecisionEngine {
    config: DecisionConfig,
    tags: FxHashMap<TagId, TagState>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config, tags: FxHashMap::default() }
    }

    fn window_s(&self) -> f64 {
        self.config.window.as_secs_f64()
    }

    fn qualifies(&self, event: &PassageEvent) -> bool {
        event.side != Side::DeadZone && event.confidence >= self.config.min_blink_confidence
    }

    /// Feed one passage event; returns any decisions it closed
    pub fn on_event(&mut self, event: &PassageEvent, now: Instant) -> Vec<Decision> {
        let mut decisions = Vec::new();
        let window_s = self.window_s();
        let qualifies = self.qualifies(event);
        let n = self.config.min_consecutive_blinks;

        let mut state = self.tags.remove(&event.tag_id).unwrap_or_default();

        // Event time beyond the window closes it before this event counts
        if let Some(window) = state.window.take() {
            if event.timestamp - window.first_ts > window_s {
                decisions.push(self.close(event.tag_id, &window, false));
            } else {
                state.window = Some(window);
            }
        }

        match state.window.as_mut() {
            None => {
                if let Some(settled) = state.settled {
                    let same_side = event.side == settled.side || event.side == Side::DeadZone;
                    if same_side && event.timestamp - settled.last_ts <= window_s {
                        if event.side == settled.side {
                            state.settled = Some(Settled { side: settled.side, last_ts: event.timestamp });
                        }
                        self.tags.insert(event.tag_id, state);
                        return decisions;
                    }
                    state.settled = None;
                }
                if qualifies {
                    debug!(
                        tag = %event.tag_id,
                        origin = event.side.as_str(),
                        "decision_window_opened"
                    );
                    state.window = Some(Window::open(event, now));
                }
            }
            Some(window) => {
                window.events += 1;
                window.last_ts = window.last_ts.max(event.timestamp);
                let destination = window.destination();

                if event.side == Side::DeadZone {
                    window.crossing_started = true;
                    window.dead_zone += 1;
                    window.reset_run();
                } else if !qualifies {
                    window.low_confidence += 1;
                } else if event.side == window.origin {
                    window.qualifying += 1;
                    window.qualifying_confidence += event.confidence;
                    if window.reached_destination {
                        if window.last_side == destination {
                            window.reversals += 1;
                        }
                        window.reset_run();
                    } else {
                        // Still approaching: the window follows the tag
                        window.first_ts = event.timestamp;
                        window.opened_at = now;
                        window.crossing_started = false;
                        window.dead_zone = 0;
                        window.low_confidence = 0;
                        window.events = 1;
                        window.qualifying = 1;
                        window.qualifying_confidence = event.confidence;
                    }
                    window.last_side = event.side;
                } else {
                    window.qualifying += 1;
                    window.qualifying_confidence += event.confidence;
                    window.crossing_started = true;
                    window.reached_destination = true;
                    window.run += 1;
                    window.run_confidence += event.confidence;
                    window.last_side = event.side;
                }

                if window.run >= n {
                    let window = window.clone();
                    state.window = None;
                    let decision = self.close(event.tag_id, &window, false);
                    state.settled = Some(Settled { side: window.destination(), last_ts: window.last_ts });
                    decisions.push(decision);
                }
            }
        }

        self.tags.insert(event.tag_id, state);
        decisions
    }

    /// Close every window whose wall-clock age exceeds the decision window
    pub fn poll_expired(&mut self, now: Instant) -> Vec<Decision> {
        let expired: Vec<TagId> = self
            .tags
            .iter()
            .filter(|(_, s)| {
                s.window.as_ref().is_some_and(|w| now.saturating_duration_since(w.opened_at) > self.config.window)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut decisions = Vec::with_capacity(expired.len());
        for tag_id in expired {
            let window = self.tags.get_mut(&tag_id).and_then(|s| s.window.take());
            if let Some(window) = window {
                decisions.push(self.close(tag_id, &window, false));
            }
        }
        decisions
    }

    /// Close every open window with NO_CALL `shutdown`
    pub fn drain(&mut self) -> Vec<Decision> {
        let tags: Vec<(TagId, Window)> =
            self.tags.drain().filter_map(|(id, s)| s.window.map(|w| (id, w))).collect();
        tags.iter().map(|(id, w)| self.close(*id, w, true)).collect()
    }

    pub fn open_windows(&self) -> usize {
        self.tags.values().filter(|s| s.window.is_some()).count()
    }

    fn verdict(&self, window: &Window) -> (DecisionResult, DecisionReason) {
        let n = self.config.min_consecutive_blinks;
        let expected_from = self.config.expected_direction.from_side();

        if window.reversals > 0 {
            (DecisionResult::Penalty, DecisionReason::DirectionReversed)
        } else if window.run >= n {
            if window.origin != expected_from {
                (DecisionResult::Penalty, DecisionReason::WrongDirection)
            } else if window.confidence() >= self.config.confidence_threshold {
                (DecisionResult::Valid, DecisionReason::CrossingConfirmed)
            } else {
                (DecisionResult::NoCall, DecisionReason::LowConfidence)
            }
        } else if window.crossing_started && window.dead_zone >= n {
            (DecisionResult::Penalty, DecisionReason::DeadZoneLinger)
        } else if window.crossing_started {
            (DecisionResult::NoCall, DecisionReason::InsufficientBlinks)
        } else {
            (DecisionResult::NoCall, DecisionReason::NoCrossing)
        }
    }

    fn close(&self, tag_id: TagId, window: &Window, shutdown: bool) -> Decision {
        let (result, reason) = if shutdown {
            (DecisionResult::NoCall, DecisionReason::Shutdown)
        } else {
            self.verdict(window)
        };

        let decision = Decision {
            tag_id,
            result,
            reason,
            confidence: window.confidence(),
            supporting_blinks: window.events,
            timestamp: window.last_ts,
            pylon_id: self.config.pylon_id,
        };

        info!(
            tag = %tag_id,
            result = result.as_str(),
            reason = reason.as_str(),
            origin = window.origin.as_str(),
            run = %window.run,
            reversals = %window.reversals,
            dead_zone = %window.dead_zone,
            confidence = format!("{:.2}", decision.confidence),
            "decision"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: TagId = TagId(0x0010);

    fn config() -> DecisionConfig {
        DecisionConfig {
            pylon_id: 1,
            min_consecutive_blinks: 3,
            window: Duration::from_millis(500),
            confidence_threshold: 0.5,
            min_blink_confidence: 0.3,
            expected_direction: CrossingDirection::ExteriorToInterior,
        }
    }

    fn event(side: Side, ts: f64, confidence: f64) -> PassageEvent {
        let signed_distance = match side {
            Side::Exterior => 3.0,
            Side::Interior => -3.0,
            Side::DeadZone => 0.2,
        };
        PassageEvent { tag_id: TAG, timestamp: ts, side, signed_distance, confidence, raw_blinks: Vec::new() }
    }

    /// Feed (side, confidence) pairs 33 ms apart, collecting decisions
    fn feed(engine: &mut DecisionEngine, seq: &[(Side, f64)], start: f64, now: Instant) -> Vec<Decision> {
        seq.iter()
            .enumerate()
            .flat_map(|(i, (side, conf))| engine.on_event(&event(*side, start + i as f64 * 0.033, *conf), now))
            .collect()
    }

    use Side::{DeadZone as D, Exterior as E, Interior as I};

    #[test]
    fn test_exact_n_consistent_blinks_is_valid() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        let decisions = feed(&mut engine, &[(E, 0.9), (E, 0.9), (D, 0.1), (I, 0.9), (I, 0.9), (I, 0.9)], 10.0, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::Valid);
        assert_eq!(decisions[0].reason, DecisionReason::CrossingConfirmed);
        assert!((decisions[0].confidence - 0.9).abs() < 1e-12);
        assert_eq!(decisions[0].pylon_id, 1);
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_n_minus_one_then_timeout_is_no_call() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        assert!(feed(&mut engine, &[(E, 0.9), (D, 0.1), (I, 0.9), (I, 0.9)], 10.0, now).is_empty());
        assert_eq!(engine.open_windows(), 1);

        assert!(engine.poll_expired(now + Duration::from_millis(400)).is_empty());
        let decisions = engine.poll_expired(now + Duration::from_millis(600));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::NoCall);
        assert_eq!(decisions[0].reason, DecisionReason::InsufficientBlinks);
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_reversal_is_penalty_never_valid() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        let decisions =
            feed(&mut engine, &[(E, 0.9), (I, 0.9), (I, 0.9), (E, 0.9), (I, 0.9), (I, 0.9), (I, 0.9)], 10.0, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::Penalty);
        assert_eq!(decisions[0].reason, DecisionReason::DirectionReversed);
    }

    #[test]
    fn test_wrong_direction() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        let decisions = feed(&mut engine, &[(I, 0.9), (I, 0.9), (E, 0.9), (E, 0.9), (E, 0.9)], 10.0, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::Penalty);
        assert_eq!(decisions[0].reason, DecisionReason::WrongDirection);
    }

    #[test]
    fn test_low_confidence_run() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        let decisions = feed(&mut engine, &[(E, 0.9), (I, 0.4), (I, 0.4), (I, 0.4)], 10.0, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::NoCall);
        assert_eq!(decisions[0].reason, DecisionReason::LowConfidence);
    }

    #[test]
    fn test_low_confidence_blinks_are_contradictions() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        let decisions = feed(&mut engine, &[(E, 0.9), (I, 0.9), (I, 0.1), (I, 0.9), (I, 0.9)], 10.0, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::Valid);
        assert!((decisions[0].confidence - 0.9 * 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_dead_zone_linger() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        feed(&mut engine, &[(E, 0.9), (D, 0.1), (D, 0.1), (D, 0.1), (D, 0.1)], 10.0, now);
        let decisions = engine.poll_expired(now + Duration::from_secs(1));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::Penalty);
        assert_eq!(decisions[0].reason, DecisionReason::DeadZoneLinger);
    }

    #[test]
    fn test_no_crossing() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        feed(&mut engine, &[(E, 0.9), (E, 0.9)], 10.0, now);
        let decisions = engine.poll_expired(now + Duration::from_secs(1));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, DecisionReason::NoCrossing);
    }

    #[test]
    fn test_origin_side_slides_window() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        // 20 exterior blinks span 660 ms, longer than the window
        let approach: Vec<(Side, f64)> = std::iter::repeat((E, 0.9)).take(20).collect();
        assert!(feed(&mut engine, &approach, 10.0, now).is_empty());

        let start = 10.0 + 20.0 * 0.033;
        let decisions = feed(&mut engine, &[(I, 0.9), (I, 0.9), (I, 0.9)], start, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].result, DecisionResult::Valid);
    }

    #[test]
    fn test_event_time_timeout_closes_before_processing() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        feed(&mut engine, &[(E, 0.9), (I, 0.9)], 10.0, now);
        let decisions = engine.on_event(&event(E, 11.0, 0.9), now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, DecisionReason::InsufficientBlinks);
        // The late event opened a fresh window
        assert_eq!(engine.open_windows(), 1);
    }

    #[test]
    fn test_trailing_blinks_after_valid_do_not_reopen() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        let mut seq = vec![(E, 0.9), (I, 0.9), (I, 0.9), (I, 0.9)];
        seq.extend(std::iter::repeat((I, 0.9)).take(30));
        let decisions = feed(&mut engine, &seq, 10.0, now);
        assert_eq!(decisions.len(), 1);
        assert_eq!(engine.open_windows(), 0);
        assert!(engine.poll_expired(now + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_drain_emits_shutdown() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        feed(&mut engine, &[(E, 0.9), (I, 0.9)], 10.0, now);
        engine.on_event(&PassageEvent { tag_id: TagId(0x0020), ..event(I, 10.0, 0.9) }, now);

        let mut decisions = engine.drain();
        decisions.sort_by_key(|d| d.tag_id);
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.reason == DecisionReason::Shutdown));
        assert!(decisions.iter().all(|d| d.result == DecisionResult::NoCall));
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_one_window_per_tag() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        feed(&mut engine, &[(E, 0.9), (E, 0.9), (E, 0.9)], 10.0, now);
        assert_eq!(engine.open_windows(), 1);
    }

    #[test]
    fn test_low_confidence_event_does_not_open_window() {
        let mut engine = DecisionEngine::new(config());
        let now = Instant::now();
        feed(&mut engine, &[(E, 0.1), (D, 0.1)], 10.0, now);
        assert_eq!(engine.open_windows(), 0);
    }
}
