//! Prometheus metrics HTTP endpoint
//!
//! Exposes processor metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, METRICS_UNCERTAINTY_BOUNDS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with pylon label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, pylon: u32, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{pylon=\"{pylon}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, pylon: u32, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{pylon=\"{pylon}\"}} {val:.6}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    pylon: u32,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{pylon=\"{pylon}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{pylon=\"{pylon}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{pylon=\"{pylon}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{pylon=\"{pylon}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, pylon: u32) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_blink_metrics(&mut output, pylon, &summary);
    write_fix_metrics(&mut output, pylon, &summary);
    write_sync_metrics(&mut output, pylon, &summary);
    write_decision_metrics(&mut output, pylon, &summary);
    write_wire_metrics(&mut output, pylon, &summary);

    output
}

fn write_blink_metrics(output: &mut String, pylon: u32, summary: &MetricsSummary) {
    write_metric(output, "pylon_blinks_total", "Total blinks processed", MetricType::Counter, pylon, summary.blinks_total);
    write_gauge_f64(output, "pylon_blinks_per_sec", "Blinks processed per second", pylon, summary.blinks_per_sec);
    write_histogram(
        output,
        "pylon_blink_latency_us",
        "Queue-to-processing latency per blink in microseconds",
        pylon,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_process_latency_us,
    );
    write_metric(
        output,
        "pylon_blink_latency_p99_us",
        "99th percentile blink latency",
        MetricType::Gauge,
        pylon,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "pylon_sequence_faults_total",
        "Blinks rejected for duplicate or out-of-order sequence numbers",
        MetricType::Counter,
        pylon,
        summary.sequence_faults,
    );
    write_metric(
        output,
        "pylon_unknown_anchor_blinks_total",
        "Blinks from anchors missing from configuration",
        MetricType::Counter,
        pylon,
        summary.unknown_anchor_blinks,
    );
    write_metric(
        output,
        "pylon_anchor_restarts_total",
        "Anchor sequence counters that restarted",
        MetricType::Counter,
        pylon,
        summary.anchor_restarts,
    );
}

fn write_fix_metrics(output: &mut String, pylon: u32, summary: &MetricsSummary) {
    write_metric(output, "pylon_fixes_total", "Position fixes computed", MetricType::Counter, pylon, summary.fixes_total);
    write_metric(
        output,
        "pylon_dropped_no_fix_total",
        "Blinks that never became part of a position fix",
        MetricType::Counter,
        pylon,
        summary.dropped_no_fix,
    );
    write_histogram(
        output,
        "pylon_fix_uncertainty_cm",
        "Position fix uncertainty in centimetres",
        pylon,
        &summary.uncertainty_buckets,
        &METRICS_UNCERTAINTY_BOUNDS,
        summary.uncertainty_avg_cm,
    );
}

fn write_sync_metrics(output: &mut String, pylon: u32, summary: &MetricsSummary) {
    write_metric(
        output,
        "pylon_sync_observations_total",
        "Sync observations received",
        MetricType::Counter,
        pylon,
        summary.sync_observations_total,
    );
    write_metric(output, "pylon_resyncs_total", "Clock model refits", MetricType::Counter, pylon, summary.resyncs_total);
    write_metric(
        output,
        "pylon_resync_failures_total",
        "Clock model refits that kept the previous model",
        MetricType::Counter,
        pylon,
        summary.resync_failures,
    );
    write_metric(
        output,
        "pylon_anchor_clock_lost_total",
        "Anchor transitions into LOST sync state",
        MetricType::Counter,
        pylon,
        summary.anchor_clock_lost_total,
    );
}

fn write_decision_metrics(output: &mut String, pylon: u32, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP pylon_decisions_total Decisions published by result");
    let _ = writeln!(output, "# TYPE pylon_decisions_total counter");
    for (result, val) in [
        ("VALID", summary.decisions_valid),
        ("PENALTY", summary.decisions_penalty),
        ("NO_CALL", summary.decisions_no_call),
    ] {
        let _ = writeln!(output, "pylon_decisions_total{{pylon=\"{pylon}\",result=\"{result}\"}} {val}");
    }
    write_metric(
        output,
        "pylon_open_windows",
        "Decision windows currently open",
        MetricType::Gauge,
        pylon,
        summary.open_windows,
    );
}

fn write_wire_metrics(output: &mut String, pylon: u32, summary: &MetricsSummary) {
    write_metric(
        output,
        "pylon_frames_decoded_total",
        "RS485 frames decoded",
        MetricType::Counter,
        pylon,
        summary.frames_decoded,
    );
    write_metric(
        output,
        "pylon_frame_crc_errors_total",
        "RS485 frames rejected by CRC",
        MetricType::Counter,
        pylon,
        summary.frame_crc_errors,
    );
    write_metric(
        output,
        "pylon_inbound_queue_depth",
        "Messages waiting in the inbound queue",
        MetricType::Gauge,
        pylon,
        summary.inbound_queue_depth,
    );
    write_metric(
        output,
        "pylon_inbound_dropped_total",
        "Collector messages dropped on a full inbound queue",
        MetricType::Counter,
        pylon,
        summary.inbound_dropped,
    );
    write_metric(
        output,
        "pylon_outbound_dropped_total",
        "Decisions or status snapshots dropped on a full outbound queue",
        MetricType::Counter,
        pylon,
        summary.outbound_dropped,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    pylon: u32,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(format_prometheus_metrics(&metrics, pylon)),
        ),
        (&Method::GET, "/health") => (StatusCode::OK, "text/plain", Bytes::from_static(b"ok")),
        _ => (StatusCode::NOT_FOUND, "text/plain", Bytes::from_static(b"Not Found")),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    pylon: u32,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, pylon = %pylon, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics, pylon).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DecisionResult;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_blink_processed(150);
        metrics.record_blink_processed(250);
        metrics.record_fix(0.12);
        metrics.record_decision(DecisionResult::Valid);
        metrics.record_decision(DecisionResult::NoCall);
        metrics.record_frame_crc_error();

        let output = format_prometheus_metrics(&metrics, 7);

        assert!(output.contains("pylon_blinks_total{pylon=\"7\"} 2"));
        assert!(output.contains("pylon_blink_latency_us_bucket{pylon=\"7\""));
        assert!(output.contains("pylon_blink_latency_us_count{pylon=\"7\"} 2"));
        assert!(output.contains("pylon_decisions_total{pylon=\"7\",result=\"VALID\"} 1"));
        assert!(output.contains("pylon_decisions_total{pylon=\"7\",result=\"PENALTY\"} 0"));
        assert!(output.contains("pylon_frame_crc_errors_total{pylon=\"7\"} 1"));
        assert!(output.contains("pylon_fixes_total{pylon=\"7\"} 1"));
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let mut output = String::new();
        let mut buckets = [0u64; METRICS_NUM_BUCKETS];
        buckets[0] = 2;
        buckets[3] = 1;
        buckets[METRICS_NUM_BUCKETS - 1] = 1;
        write_histogram(&mut output, "x", "help", 1, &buckets, &METRICS_BUCKET_BOUNDS, 10);

        assert!(output.contains(&format!("x_bucket{{pylon=\"1\",le=\"{}\"}} 2", METRICS_BUCKET_BOUNDS[0])));
        assert!(output.contains(&format!("x_bucket{{pylon=\"1\",le=\"{}\"}} 3", METRICS_BUCKET_BOUNDS[3])));
        assert!(output.contains("x_bucket{pylon=\"1\",le=\"+Inf\"} 4"));
        assert!(output.contains("x_sum{pylon=\"1\"} 40"));
    }
}
