//! Pylon processor - UWB pylon-racing crossing judge
//!
//! Reads anchor frames from the RS485 bus (or a simulated bus), aligns the
//! anchor clocks, locates each tag transmission against the pylon plane and
//! publishes VALID / PENALTY / NO_CALL decisions with periodic status.
//!
//! Module structure:
//! - `domain/` - Core types (blinks, passage events, decisions, geometry)
//! - `io/` - External interfaces (RS485, simulator, queues, Prometheus)
//! - `services/` - Pipeline stages (clock sync, correlation, geometry, decisions)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use pylon_processor::domain::types::OutboundEvent;
use pylon_processor::infra::{Config, Metrics};
use pylon_processor::io::{
    create_blink_queue, create_outbound_channel, Rs485Collector, Simulator, SimulatorConfig,
};
use pylon_processor::services::Processor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Pylon processor - judges pylon crossings from UWB anchor timestamps
#[derive(Parser, Debug)]
#[command(name = "pylon-processor", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Replace the RS485 bus with a synthetic pass
    #[arg(short, long)]
    simulate: bool,

    /// Print decisions and status snapshots to stdout as JSON lines
    #[arg(long)]
    json: bool,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "pylon_processor_starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    config.validate().with_context(|| format!("invalid configuration in {}", config.config_file()))?;

    info!(
        config_file = %config.config_file(),
        pylon_id = %config.pylon_id(),
        anchors = %config.anchors().len(),
        master_anchor = %config.master_anchor_id(),
        dead_zone_m = %config.dead_zone_m(),
        min_consecutive_blinks = %config.min_consecutive_blinks(),
        decision_window_ms = %config.decision_window_ms(),
        expected_direction = ?config.expected_direction(),
        rs485_ports = ?config.rs485_ports(),
        simulate = %args.simulate,
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let pylon_id = config.pylon_id();
        tokio::spawn(async move {
            if let Err(e) = pylon_processor::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                pylon_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    let push_timeout = Duration::from_millis(config.push_timeout_ms());
    let (blink_queue, inbound_rx) = create_blink_queue(config.blink_capacity(), push_timeout, metrics.clone());
    let (outbound, outbound_rx) = create_outbound_channel(config.event_capacity(), push_timeout);

    // Producers; the inbound queue closes once all of them have finished
    if args.simulate {
        let simulator = Simulator::from_config(&config, SimulatorConfig::default())
            .context("cannot build simulated scenario")?;
        let sim_metrics = metrics.clone();
        let sim_shutdown = shutdown_rx.clone();
        tokio::spawn(simulator.run(blink_queue, sim_metrics, sim_shutdown));
    } else {
        for device in config.rs485_ports() {
            let collector = Rs485Collector::new(device, config.rs485_baud(), blink_queue.clone(), metrics.clone());
            tokio::spawn(collector.run(shutdown_rx.clone()));
        }
        drop(blink_queue);
    }

    let processor = Processor::new(&config, metrics.clone(), outbound).context("cannot build processor")?;
    let processor_handle = tokio::spawn(processor.run(inbound_rx, shutdown_rx.clone()));
    let consumer_handle = tokio::spawn(consume_outbound(outbound_rx, args.json));

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c_handler_failed");
            return;
        }
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Processor drains open windows before returning
    if let Err(e) = processor_handle.await {
        error!(error = %e, "processor_task_failed");
    }
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "outbound_consumer_failed");
    }

    metrics.report().log();
    info!("pylon-processor shutdown complete");
    Ok(())
}

/// Drain the outbound queue into logs, or stdout with `--json`
async fn consume_outbound(mut outbound_rx: mpsc::Receiver<OutboundEvent>, json: bool) {
    while let Some(event) = outbound_rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "outbound_serialize_failed"),
            }
            continue;
        }

        match event {
            OutboundEvent::Decision(d) => info!(
                tag = %d.tag_id,
                result = d.result.as_str(),
                reason = d.reason.as_str(),
                confidence = format!("{:.2}", d.confidence),
                supporting_blinks = %d.supporting_blinks,
                timestamp = format!("{:.3}", d.timestamp),
                pylon_id = %d.pylon_id,
                "decision"
            ),
            OutboundEvent::Status(s) => info!(
                anchors = %s.anchors.len(),
                tags_seen = %s.tags_seen.len(),
                total_blinks = %s.total_blinks,
                total_decisions = %s.total_decisions,
                dropped_no_fix = %s.dropped_no_fix,
                sequence_faults = %s.sequence_faults,
                open_windows = %s.open_windows,
                degraded = %s.degraded,
                "system_status"
            ),
        }
    }
}
