//! Reliable register access to FPGA firmware over packetized byte streams.
//!
//! fwlink layers a packetizer, a reliable transport (RSSI) and a register
//! protocol (SRP) over any connected byte stream.
//!
//! # Crate Structure
//!
//! - [`stream`]: frames, buffers, stage traits and the byte-stream link
//! - [`packetizer`]: channel multiplexing with segmentation and CRC
//! - [`rssi`]: sequenced, acknowledged, retransmitting transport
//! - [`srp`]: register read/write transactions and a memory emulator
//! - [`stack`]: assembles the layers into host and device endpoints

/// Re-export stream types.
pub mod stream {
    pub use fwlink_stream::*;
}

/// Re-export packetizer types.
pub mod packetizer {
    pub use fwlink_packetizer::*;
}

/// Re-export reliable transport types.
pub mod rssi {
    pub use fwlink_rssi::*;
}

/// Re-export register protocol types.
pub mod srp {
    pub use fwlink_srp::*;
}

pub mod stack;

pub use stack::{DeviceStack, HostStack, Stack, StackConfig, StackError, StackStats};
