//! RS485 anchor bus collector
//!
//! Protocol:
//! - Baud: 115200, 8N1 (configurable)
//! - Anchors stream blink, sync and status frames unsolicited
//! - Frame layout and CRC in `io::frame`
//!
//! One collector per serial port. Decoded frames are pushed to the inbound
//! queue; the port is reopened after errors until shutdown.

use crate::domain::types::CollectorMessage;
use crate::infra::metrics::Metrics;
use crate::io::frame::FrameDecoder;
use crate::io::queue::BlinkQueue;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};

/// Delay before reopening a failed port
const REOPEN_DELAY: Duration = Duration::from_secs(2);
/// Serial read timeout
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Rs485Collector {
    device: String,
    baud: u32,
    queue: BlinkQueue,
    metrics: Arc<Metrics>,
    decoder: FrameDecoder,
    /// CRC error count already reported to metrics
    reported_crc_errors: u64,
}

impl Rs485Collector {
    pub fn new(device: &str, baud: u32, queue: BlinkQueue, metrics: Arc<Metrics>) -> Self {
        Self {
            device: device.to_string(),
            baud,
            queue,
            metrics,
            decoder: FrameDecoder::new(),
            reported_crc_errors: 0,
        }
    }

    /// Decode bytes and forward every complete frame
    ///
    /// Returns false once the processor has gone away.
    async fn forward(&mut self, bytes: &[u8]) -> bool {
        let received_at = Instant::now();
        let frames = self.decoder.decode(bytes);

        let crc_errors = self.decoder.crc_errors();
        for _ in self.reported_crc_errors..crc_errors {
            self.metrics.record_frame_crc_error();
        }
        self.reported_crc_errors = crc_errors;

        for frame in frames {
            self.metrics.record_frame_decoded();
            let message: CollectorMessage = frame.into_message(received_at);
            if let Err(e) = self.queue.push(message).await {
                if self.queue.is_closed() {
                    return false;
                }
                warn!(device = %self.device, error = %e, "rs485_frame_dropped");
            }
        }
        self.metrics.set_inbound_queue_depth(self.queue.depth() as u64);
        true
    }

    /// Read frames until shutdown or the inbound queue closes
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(device = %self.device, baud = %self.baud, "rs485_collector_started");

        loop {
            let port = tokio_serial::new(&self.device, self.baud).timeout(READ_TIMEOUT).open_native_async();
            let mut port = match port {
                Ok(p) => {
                    info!(device = %self.device, "rs485_port_opened");
                    p
                }
                Err(e) => {
                    error!(device = %self.device, error = %e, "rs485_port_open_failed");
                    tokio::select! {
                        _ = tokio::time::sleep(REOPEN_DELAY) => {}
                        _ = shutdown.changed() => {
                            info!(device = %self.device, "rs485_shutdown");
                            return;
                        }
                    }
                    continue;
                }
            };

            let mut buf = [0u8; 256];
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(device = %self.device, "rs485_shutdown");
                            return;
                        }
                    }
                    read = port.read(&mut buf) => {
                        match read {
                            Ok(0) => {}
                            Ok(n) => {
                                if !self.forward(&buf[..n]).await {
                                    info!(device = %self.device, "rs485_queue_closed");
                                    return;
                                }
                            }
                            Err(e) if e.kind() == ErrorKind::TimedOut => {}
                            Err(e) => {
                                warn!(device = %self.device, error = %e, "rs485_read_error");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(REOPEN_DELAY) => {}
                _ = shutdown.changed() => {
                    info!(device = %self.device, "rs485_shutdown");
                    return;
                }
            }
        }
    }
}
