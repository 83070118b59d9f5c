//! End-to-end tests: simulated anchor bus through the full processor

use pylon_processor::domain::types::{DecisionResult, OutboundEvent, TagId};
use pylon_processor::infra::{Config, Metrics};
use pylon_processor::io::frame::FrameDecoder;
use pylon_processor::io::{create_blink_queue, create_outbound_channel, Simulator, SimulatorConfig};
use pylon_processor::services::Processor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const ANCHORS: [(u8, [f64; 3]); 5] = [
    (0x11, [0.0, -10.0, 0.5]),
    (0x12, [0.0, 10.0, 0.5]),
    (0x13, [-15.0, 0.0, 6.0]),
    (0x14, [15.0, 0.0, 3.0]),
    (0x15, [5.0, 5.0, 8.0]),
];

fn config() -> Config {
    Config::default().with_geometry([0.0; 3], [1.0, 0.0, 0.0], &ANCHORS).with_master_anchor(0x11)
}

fn drain(rx: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_simulated_pass_is_valid() {
    let config = config();
    config.validate().unwrap();
    let metrics = Arc::new(Metrics::new());
    let (outbound, mut rx) = create_outbound_channel(64, Duration::from_millis(10));
    let mut processor = Processor::new(&config, metrics.clone(), outbound).unwrap();

    let simulator = Simulator::from_config(&config, SimulatorConfig::default()).unwrap();
    let mut decoder = FrameDecoder::new();
    let mut wire = Vec::new();
    for scheduled in simulator.generate() {
        wire.extend(scheduled.frame.encode());
    }

    // Whole capture in uneven chunks, as a serial port would deliver it
    for chunk in wire.chunks(37) {
        for frame in decoder.decode(chunk) {
            processor.handle(frame.into_message(Instant::now())).await;
        }
    }
    assert_eq!(decoder.crc_errors(), 0);

    let decisions: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            OutboundEvent::Decision(d) => Some(d),
            OutboundEvent::Status(_) => None,
        })
        .collect();
    assert_eq!(decisions.len(), 1, "decisions: {:?}", decisions);
    let decision = &decisions[0];
    assert_eq!(decision.tag_id, TagId(0x0001));
    assert_eq!(decision.result, DecisionResult::Valid);
    assert!(decision.confidence >= config.confidence_threshold());
    assert!(decision.supporting_blinks >= config.min_consecutive_blinks());

    let status = processor.status(Instant::now());
    assert!(!status.degraded);
    assert_eq!(status.sequence_faults, 0);
    assert_eq!(status.dropped_no_fix, 0);
    assert_eq!(status.total_decisions, 1);
    assert!(metrics.report().fixes_total > 0);
}

#[tokio::test]
async fn test_reverse_direction_is_penalty() {
    let config = config();
    let metrics = Arc::new(Metrics::new());
    let (outbound, mut rx) = create_outbound_channel(64, Duration::from_millis(10));
    let mut processor = Processor::new(&config, metrics, outbound).unwrap();

    // Fly the configured pass backwards by mirroring the plane for the simulator only
    let mirrored = Config::default().with_geometry([0.0; 3], [-1.0, 0.0, 0.0], &ANCHORS).with_master_anchor(0x11);
    let simulator = Simulator::from_config(&mirrored, SimulatorConfig::default()).unwrap();
    for scheduled in simulator.generate() {
        processor.handle(scheduled.frame.into_message(Instant::now())).await;
    }

    let results: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            OutboundEvent::Decision(d) => Some(d.result),
            OutboundEvent::Status(_) => None,
        })
        .collect();
    assert_eq!(results, vec![DecisionResult::Penalty]);
}

#[tokio::test]
async fn test_run_with_simulator_task() {
    let config = config();
    let metrics = Arc::new(Metrics::new());
    let (queue, inbound_rx) = create_blink_queue(config.blink_capacity(), Duration::from_millis(50), metrics.clone());
    let (outbound, mut outbound_rx) = create_outbound_channel(64, Duration::from_millis(10));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let simulator = Simulator::from_config(&config, SimulatorConfig { time_scale: 20.0, ..SimulatorConfig::default() })
        .unwrap();
    let processor = Processor::new(&config, metrics.clone(), outbound).unwrap();

    tokio::spawn(simulator.run(queue, metrics.clone(), shutdown_rx.clone()));
    let processor_task = tokio::spawn(processor.run(inbound_rx, shutdown_rx));

    let mut decisions = Vec::new();
    let mut last_status = None;
    while let Some(event) = outbound_rx.recv().await {
        match event {
            OutboundEvent::Decision(d) => decisions.push(d),
            OutboundEvent::Status(s) => last_status = Some(s),
        }
    }
    processor_task.await.unwrap();

    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].result, DecisionResult::Valid);
    let status = last_status.expect("final status is always published");
    assert_eq!(status.open_windows, 0);
    assert!(status.tags_seen.contains(&TagId(0x0001)));
    assert!(metrics.report().frames_decoded > 0);
}
