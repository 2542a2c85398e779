//! Channel multiplexing over a single physical link.
//!
//! Outbound frames are split into packets no larger than the configured
//! payload size. Every packet carries:
//! - a flag byte with start/end-of-frame markers and the packet format version
//! - a 1-byte channel id
//! - a 2-byte little-endian per-channel sequence number
//! - a 4-byte little-endian CRC32 over the header fields and payload
//!
//! Inbound packets are reassembled per channel. A corrupt or missing packet
//! costs only the frame it belonged to, on its own channel.

pub mod application;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod packet;

pub use application::Application;
pub use channel::REGISTER;
pub use config::{PacketizerConfig, DEFAULT_MAX_PACKET_PAYLOAD, DEFAULT_QUEUE_DEPTH};
pub use controller::{Controller, PacketizerSnapshot, PacketizerStats};
pub use error::{PacketizerError, Result};
pub use packet::{decode_packet, encode_packet, Packet, PacketHeader, HEADER_SIZE};
