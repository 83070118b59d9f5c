//! Anchor RS485 wire format
//!
//! All fields little-endian, CRC16 over every preceding byte:
//! - Blink (14 B):  `0xAA | anchor u8 | tag u16 | seq u16 | ts 40-bit | rssi i8 | crc u16`
//! - Sync (13 B):   `0x55 | anchor u8 | sync_count u32 | ts 40-bit | crc u16`
//! - Status (9 B):  `0xBB | anchor u8 | status u8 | drift_ppm i16 | sync_age_ms u16 | crc u16`
//!
//! CRC is CRC-16/MCRF4XX: init 0xFFFF, reflected poly 0x8408, no final xor.

use crate::domain::types::{
    AnchorId, AnchorReport, AnchorReportedStatus, BlinkEvent, CollectorMessage, SyncObservation, TagId,
};
use std::time::Instant;
use tracing::{debug, warn};

pub const START_BLINK: u8 = 0xAA;
pub const START_SYNC: u8 = 0x55;
pub const START_STATUS: u8 = 0xBB;

pub const BLINK_FRAME_LEN: usize = 14;
pub const SYNC_FRAME_LEN: usize = 13;
pub const STATUS_FRAME_LEN: usize = 9;

/// Largest frame; buffers never need more than a few of these
const MAX_FRAME_LEN: usize = BLINK_FRAME_LEN;

const TIMESTAMP_MASK: u64 = (1 << 40) - 1;

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn frame_len(start: u8) -> Option<usize> {
    match start {
        START_BLINK => Some(BLINK_FRAME_LEN),
        START_SYNC => Some(SYNC_FRAME_LEN),
        START_STATUS => Some(STATUS_FRAME_LEN),
        _ => None,
    }
}

#[inline]
fn read_u40(bytes: &[u8]) -> u64 {
    bytes[..5].iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

#[inline]
fn write_u40(out: &mut Vec<u8>, value: u64) {
    let value = value & TIMESTAMP_MASK;
    out.extend_from_slice(&value.to_le_bytes()[..5]);
}

/// One decoded anchor frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Blink { anchor_id: AnchorId, tag_id: TagId, seq_num: u16, timestamp: u64, rssi: i8 },
    Sync { anchor_id: AnchorId, sync_count: u32, timestamp: u64 },
    Status { anchor_id: AnchorId, status: u8, drift_ppm: i16, last_sync_age_ms: u16 },
}

impl Frame {
    fn parse(bytes: &[u8]) -> Option<Frame> {
        let anchor_id = AnchorId(*bytes.get(1)?);
        match bytes[0] {
            START_BLINK if bytes.len() == BLINK_FRAME_LEN => Some(Frame::Blink {
                anchor_id,
                tag_id: TagId(u16::from_le_bytes([bytes[2], bytes[3]])),
                seq_num: u16::from_le_bytes([bytes[4], bytes[5]]),
                timestamp: read_u40(&bytes[6..11]),
                rssi: bytes[11] as i8,
            }),
            START_SYNC if bytes.len() == SYNC_FRAME_LEN => Some(Frame::Sync {
                anchor_id,
                sync_count: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
                timestamp: read_u40(&bytes[6..11]),
            }),
            START_STATUS if bytes.len() == STATUS_FRAME_LEN => Some(Frame::Status {
                anchor_id,
                status: bytes[2],
                drift_ppm: i16::from_le_bytes([bytes[3], bytes[4]]),
                last_sync_age_ms: u16::from_le_bytes([bytes[5], bytes[6]]),
            }),
            _ => None,
        }
    }

    /// Serialize with CRC, as an anchor would send it
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_FRAME_LEN);
        match *self {
            Frame::Blink { anchor_id, tag_id, seq_num, timestamp, rssi } => {
                out.push(START_BLINK);
                out.push(anchor_id.0);
                out.extend_from_slice(&tag_id.0.to_le_bytes());
                out.extend_from_slice(&seq_num.to_le_bytes());
                write_u40(&mut out, timestamp);
                out.push(rssi as u8);
            }
            Frame::Sync { anchor_id, sync_count, timestamp } => {
                out.push(START_SYNC);
                out.push(anchor_id.0);
                out.extend_from_slice(&sync_count.to_le_bytes());
                write_u40(&mut out, timestamp);
            }
            Frame::Status { anchor_id, status, drift_ppm, last_sync_age_ms } => {
                out.push(START_STATUS);
                out.push(anchor_id.0);
                out.push(status);
                out.extend_from_slice(&drift_ppm.to_le_bytes());
                out.extend_from_slice(&last_sync_age_ms.to_le_bytes());
            }
        }
        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Convert into a processor message, stamped with the receive time
    pub fn into_message(self, received_at: Instant) -> CollectorMessage {
        match self {
            Frame::Blink { anchor_id, tag_id, seq_num, timestamp, rssi } => CollectorMessage::Blink(BlinkEvent {
                anchor_id,
                tag_id,
                seq_num,
                timestamp_raw: timestamp,
                timestamp_corrected: 0.0,
                rssi,
                received_at,
            }),
            Frame::Sync { anchor_id, sync_count, timestamp } => CollectorMessage::Sync(SyncObservation {
                anchor_id,
                sync_count,
                timestamp_raw: timestamp,
                received_at,
            }),
            Frame::Status { anchor_id, status, drift_ppm, last_sync_age_ms } => {
                CollectorMessage::AnchorReport(AnchorReport {
                    anchor_id,
                    status: AnchorReportedStatus::from_code(status),
                    drift_ppm,
                    last_sync_age_ms,
                })
            }
        }
    }
}

/// Streaming decoder over a byte stream that may split, merge, or corrupt frames
pub struct FrameDecoder {
    /// Persistent buffer: serial reads can end mid-frame
    buffer: Vec<u8>,
    frames: u64,
    crc_errors: u64,
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(MAX_FRAME_LEN * 8), frames: 0, crc_errors: 0, discarded: 0 }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drop bytes until the buffer starts with a known start byte
    fn synchronize(&mut self) {
        match self.buffer.iter().position(|&b| frame_len(b).is_some()) {
            Some(0) => {}
            Some(start_idx) => {
                debug!(discarded = start_idx, "frame_sync_discarded_bytes");
                self.discarded += start_idx as u64;
                self.buffer.drain(..start_idx);
            }
            None => {
                if !self.buffer.is_empty() {
                    debug!(discarded = self.buffer.len(), "frame_sync_no_start_byte");
                    self.discarded += self.buffer.len() as u64;
                    self.buffer.clear();
                }
            }
        }
    }

    /// Next complete, CRC-valid frame, if the buffer holds one
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            self.synchronize();
            let len = frame_len(*self.buffer.first()?)?;
            if self.buffer.len() < len {
                return None;
            }

            let candidate = &self.buffer[..len];
            let expected = u16::from_le_bytes([candidate[len - 2], candidate[len - 1]]);
            if crc16(&candidate[..len - 2]) == expected {
                let frame = Frame::parse(candidate);
                self.buffer.drain(..len);
                if let Some(frame) = frame {
                    self.frames += 1;
                    return Some(frame);
                }
                continue;
            }

            warn!(
                checksum_error = true,
                raw_bytes = %hex::encode(candidate),
                "frame_crc_failed"
            );
            self.crc_errors += 1;
            // The start byte may have been payload; resync from the next byte
            self.buffer.drain(..1);
            self.discarded += 1;
        }
    }

    /// Push bytes and return every frame now complete
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.push(bytes);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
