//! RS485 Anchor Bus Dump Tool
//!
//! Prints every decoded anchor frame from a serial port or a raw capture file,
//! with per-anchor counters on exit. Useful for checking wiring, baud rate and
//! CRC health before running the processor.
//!
//! Usage:
//!   cargo run --bin rs485-dump -- --device /dev/ttyUSB0
//!   cargo run --bin rs485-dump -- --file capture.bin

use anyhow::Context;
use clap::Parser;
use pylon_processor::domain::types::AnchorId;
use pylon_processor::io::frame::{Frame, FrameDecoder};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;

#[derive(Parser, Debug)]
#[command(name = "rs485-dump", about = "Decode and print anchor RS485 frames")]
struct Args {
    #[arg(long, default_value = "/dev/ttyUSB0")]
    device: String,

    #[arg(long, default_value = "115200")]
    baud: u32,

    /// Decode a raw byte capture instead of a serial port
    #[arg(long)]
    file: Option<String>,

    /// Also print every raw read as hex
    #[arg(long)]
    raw: bool,

    /// Only print frames from this anchor id
    #[arg(long)]
    anchor: Option<u8>,

    /// Stop after this many seconds (serial only)
    #[arg(long)]
    seconds: Option<u64>,
}

fn wall_clock() -> String {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()).format(&Rfc3339).unwrap_or_default()
}

#[derive(Default)]
struct AnchorCounts {
    blinks: u64,
    syncs: u64,
    statuses: u64,
}

fn anchor_of(frame: &Frame) -> AnchorId {
    match frame {
        Frame::Blink { anchor_id, .. } | Frame::Sync { anchor_id, .. } | Frame::Status { anchor_id, .. } => *anchor_id,
    }
}

fn print_frame(elapsed: Duration, frame: &Frame) {
    let ms = elapsed.as_millis();
    match frame {
        Frame::Blink { anchor_id, tag_id, seq_num, timestamp, rssi } => {
            println!("[{ms:>8}ms] BLINK  anchor={anchor_id} tag={tag_id} seq={seq_num:>5} ts={timestamp:>13} rssi={rssi}")
        }
        Frame::Sync { anchor_id, sync_count, timestamp } => {
            println!("[{ms:>8}ms] SYNC   anchor={anchor_id} count={sync_count:>6} ts={timestamp:>13}")
        }
        Frame::Status { anchor_id, status, drift_ppm, last_sync_age_ms } => {
            println!(
                "[{ms:>8}ms] STATUS anchor={anchor_id} status={status} drift={drift_ppm}ppm sync_age={last_sync_age_ms}ms"
            )
        }
    }
}

struct Dump {
    decoder: FrameDecoder,
    counts: BTreeMap<AnchorId, AnchorCounts>,
    filter: Option<AnchorId>,
    raw: bool,
    started: Instant,
}

impl Dump {
    fn feed(&mut self, bytes: &[u8]) {
        let elapsed = self.started.elapsed();
        if self.raw {
            println!("[{:>8}ms] RAW    {}", elapsed.as_millis(), hex::encode(bytes));
        }
        for frame in self.decoder.decode(bytes) {
            let anchor = anchor_of(&frame);
            let counts = self.counts.entry(anchor).or_default();
            match frame {
                Frame::Blink { .. } => counts.blinks += 1,
                Frame::Sync { .. } => counts.syncs += 1,
                Frame::Status { .. } => counts.statuses += 1,
            }
            if self.filter.map_or(true, |f| f == anchor) {
                print_frame(elapsed, &frame);
            }
        }
    }

    fn summary(&self) {
        println!();
        println!("Stopped at {}", wall_clock());
        println!("Frames: {}  CRC errors: {}  Discarded bytes: {}", self.decoder.frames(), self.decoder.crc_errors(), self.decoder.discarded());
        for (anchor, c) in &self.counts {
            println!("  {anchor}: blinks={} syncs={} status={}", c.blinks, c.syncs, c.statuses);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut dump = Dump {
        decoder: FrameDecoder::new(),
        counts: BTreeMap::new(),
        filter: args.anchor.map(AnchorId),
        raw: args.raw,
        started: Instant::now(),
    };

    if let Some(path) = &args.file {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read capture {path}"))?;
        dump.feed(&bytes);
        dump.summary();
        return Ok(());
    }

    println!("Opening {} @ {} baud...", args.device, args.baud);
    let mut port = tokio_serial::new(&args.device, args.baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .with_context(|| format!("Failed to open {}", args.device))?;
    println!("Listening since {} (Ctrl+C to stop)\n", wall_clock());

    let deadline = args.seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut buf = [0u8; 256];
    loop {
        let stop = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stop => break,
            read = port.read(&mut buf) => match read {
                Ok(0) => {}
                Ok(n) => dump.feed(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e).context("Serial read failed"),
            },
        }
    }

    dump.summary();
    Ok(())
}
