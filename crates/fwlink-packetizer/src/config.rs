use serde::{Deserialize, Serialize};

/// Default largest payload carried by one packet.
pub const DEFAULT_MAX_PACKET_PAYLOAD: usize = 1024;

/// Default transmit queue depth per application.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Packetizer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketizerConfig {
    /// Largest payload per packet, excluding the packet header.
    pub max_packet_payload: usize,
    /// Frames an application may queue before `push_frame` blocks.
    pub queue_depth: usize,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            max_packet_payload: DEFAULT_MAX_PACKET_PAYLOAD,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}
