//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame` - RS485 anchor wire format and stream decoder
//! - `rs485` - serial collector feeding the inbound queue
//! - `simulator` - synthetic anchor bus for `--simulate`
//! - `queue` - bounded inbound and outbound queues
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod frame;
pub mod prometheus;
pub mod queue;
pub mod rs485;
pub mod simulator;

// Re-export commonly used types
pub use frame::{Frame, FrameDecoder};
pub use queue::{create_blink_queue, create_outbound_channel, BlinkQueue, OutboundSender};
pub use rs485::Rs485Collector;
pub use simulator::{Simulator, SimulatorConfig};
