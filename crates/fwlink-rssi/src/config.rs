use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::header::SynParams;

/// Protocol version announced in SYN segments.
pub const PROTOCOL_VERSION: u8 = 1;

/// Connection tuning for one RSSI endpoint.
///
/// A client announces these values in its SYN; a server adopts whatever the
/// client announced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RssiConfig {
    /// Wait for a peer's SYN instead of opening actively.
    pub server: bool,
    pub version: u8,
    /// Unacknowledged segments allowed in flight.
    pub max_outstanding: u16,
    /// Largest data payload per segment, in bytes.
    pub max_segment_size: u16,
    /// Base delay before an unacknowledged segment is resent.
    pub retransmit_timeout: Duration,
    /// Longest an inbound segment may wait for its acknowledgment.
    pub cumulative_ack_timeout: Duration,
    /// Idle time after which a client sends NUL. Peers silent for three
    /// times this long are considered gone.
    pub null_timeout: Duration,
    /// Resends of one segment before the connection is closed.
    pub max_retransmissions: u8,
    /// Inbound segments acknowledged together.
    pub max_cumulative_ack: u8,
    /// Upper bound for the exponential retransmission backoff.
    pub max_backoff: Duration,
    /// How long `push_frame` waits for window space.
    pub tx_timeout: Duration,
    /// Sequence number of the first SYN.
    pub initial_sequence: u16,
    /// Identifier announced in the SYN parameter block.
    pub connection_id: u16,
}

impl Default for RssiConfig {
    fn default() -> Self {
        Self {
            server: false,
            version: PROTOCOL_VERSION,
            max_outstanding: 32,
            max_segment_size: 1024,
            retransmit_timeout: Duration::from_millis(100),
            cumulative_ack_timeout: Duration::from_millis(20),
            null_timeout: Duration::from_secs(1),
            max_retransmissions: 15,
            max_cumulative_ack: 2,
            max_backoff: Duration::from_secs(2),
            tx_timeout: Duration::from_secs(5),
            initial_sequence: 0,
            connection_id: 0,
        }
    }
}

fn millis(duration: Duration) -> u16 {
    duration.as_millis().min(u16::MAX as u128) as u16
}

impl RssiConfig {
    /// Parameter block announced in this endpoint's SYN.
    pub fn syn_params(&self) -> SynParams {
        SynParams {
            version: self.version,
            max_outstanding: self.max_outstanding,
            max_segment_size: self.max_segment_size,
            retransmit_timeout_ms: millis(self.retransmit_timeout),
            cumulative_ack_timeout_ms: millis(self.cumulative_ack_timeout),
            null_timeout_ms: millis(self.null_timeout),
            max_retransmissions: self.max_retransmissions,
            max_cumulative_ack: self.max_cumulative_ack,
            connection_id: self.connection_id,
        }
    }

    /// Take over the values a peer announced, keeping local-only settings.
    pub fn adopt(&self, params: &SynParams) -> Self {
        Self {
            max_outstanding: params.max_outstanding.max(1),
            max_segment_size: params.max_segment_size.max(1),
            retransmit_timeout: Duration::from_millis(u64::from(
                params.retransmit_timeout_ms.max(1),
            )),
            cumulative_ack_timeout: Duration::from_millis(u64::from(
                params.cumulative_ack_timeout_ms.max(1),
            )),
            null_timeout: Duration::from_millis(u64::from(params.null_timeout_ms.max(1))),
            max_retransmissions: params.max_retransmissions,
            max_cumulative_ack: params.max_cumulative_ack.max(1),
            connection_id: params.connection_id,
            ..self.clone()
        }
    }
}
