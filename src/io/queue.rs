//! Bounded queues at the processor's edges
//!
//! Inbound: collectors push `CollectorMessage`s with a bounded wait; a push
//! that times out is dropped and reported as `QueueFull`.
//! Outbound: the processor publishes decisions with a bounded wait and
//! status snapshots without waiting, so a stalled consumer never stalls
//! ingestion.

use crate::domain::error::ProcessorError;
use crate::domain::types::{CollectorMessage, Decision, OutboundEvent, SystemStatus};
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// Producer handle for the inbound queue
#[derive(Clone)]
pub struct BlinkQueue {
    tx: mpsc::Sender<CollectorMessage>,
    push_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl BlinkQueue {
    pub fn new(tx: mpsc::Sender<CollectorMessage>, push_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self { tx, push_timeout, metrics }
    }

    /// Push with a bounded wait
    ///
    /// A closed queue is reported as full too; the processor is gone either way.
    pub async fn push(&self, message: CollectorMessage) -> Result<(), ProcessorError> {
        match self.tx.send_timeout(message, self.push_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Closed(_)) => {
                self.metrics.record_inbound_dropped();
                Err(ProcessorError::QueueFull { queue: "inbound" })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Messages currently queued
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Create the inbound queue with the given capacity
pub fn create_blink_queue(
    capacity: usize,
    push_timeout: Duration,
    metrics: Arc<Metrics>,
) -> (BlinkQueue, mpsc::Receiver<CollectorMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (BlinkQueue::new(tx, push_timeout, metrics), rx)
}

/// Processor-side handle for the outbound queue
pub struct OutboundSender {
    tx: mpsc::Sender<OutboundEvent>,
    push_timeout: Duration,
}

impl OutboundSender {
    pub fn new(tx: mpsc::Sender<OutboundEvent>, push_timeout: Duration) -> Self {
        Self { tx, push_timeout }
    }

    /// Publish a decision, waiting at most the push timeout
    pub async fn send_decision(&self, decision: Decision) -> Result<(), ProcessorError> {
        self.tx
            .send_timeout(OutboundEvent::Decision(decision), self.push_timeout)
            .await
            .map_err(|_| ProcessorError::QueueFull { queue: "outbound" })
    }

    /// Publish a status snapshot without waiting
    pub fn send_status(&self, status: SystemStatus) -> Result<(), ProcessorError> {
        match self.tx.try_send(OutboundEvent::Status(status)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Err(ProcessorError::QueueFull { queue: "outbound" })
            }
        }
    }
}

/// Create the outbound queue with the given capacity
pub fn create_outbound_channel(
    capacity: usize,
    push_timeout: Duration,
) -> (OutboundSender, mpsc::Receiver<OutboundEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSender::new(tx, push_timeout), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AnchorId, AnchorReport, AnchorReportedStatus, DecisionReason, DecisionResult, TagId};

    fn report() -> CollectorMessage {
        CollectorMessage::AnchorReport(AnchorReport {
            anchor_id: AnchorId(0x12),
            status: AnchorReportedStatus::Ok,
            drift_ppm: 3,
            last_sync_age_ms: 120,
        })
    }

    fn decision() -> Decision {
        Decision {
            tag_id: TagId(1),
            result: DecisionResult::Valid,
            reason: DecisionReason::CrossingConfirmed,
            confidence: 0.9,
            supporting_blinks: 4,
            timestamp: 1.0,
            pylon_id: 1,
        }
    }

    #[tokio::test]
    async fn test_push_times_out_when_full() {
        let metrics = Arc::new(Metrics::new());
        let (queue, mut rx) = create_blink_queue(1, Duration::from_millis(10), metrics.clone());

        queue.push(report()).await.unwrap();
        assert_eq!(queue.depth(), 1);
        let err = queue.push(report()).await.unwrap_err();
        assert_eq!(err, ProcessorError::QueueFull { queue: "inbound" });
        assert_eq!(metrics.inbound_dropped(), 1);

        assert!(rx.recv().await.is_some());
        queue.push(report()).await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_full_does_not_block() {
        let (sender, mut rx) = create_outbound_channel(1, Duration::from_millis(10));
        sender.send_decision(decision()).await.unwrap();

        let started = std::time::Instant::now();
        assert!(sender.send_decision(decision()).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));

        match rx.recv().await {
            Some(OutboundEvent::Decision(d)) => assert_eq!(d.result, DecisionResult::Valid),
            other => panic!("unexpected {:?}", other),
        }
    }
}
