use std::time::Duration;

use fwlink_stream::StreamError;
use serde::Serialize;

/// Why a connection left the established state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer sent RST.
    Reset,
    /// A segment went unacknowledged through every retransmission.
    RetransmitExhausted,
    /// The SYN exchange did not complete.
    HandshakeTimeout,
    /// Nothing was heard from the peer within the keepalive window.
    PeerTimeout,
    /// The peer announced an incompatible protocol version.
    VersionMismatch,
    /// Closed locally.
    LocalClose,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::Reset => "reset by peer",
            CloseReason::RetransmitExhausted => "retransmissions exhausted",
            CloseReason::HandshakeTimeout => "handshake timed out",
            CloseReason::PeerTimeout => "peer keepalive timed out",
            CloseReason::VersionMismatch => "protocol version mismatch",
            CloseReason::LocalClose => "closed locally",
        };
        f.write_str(text)
    }
}

/// Errors raised by the reliable transport.
#[derive(Debug, thiserror::Error)]
pub enum RssiError {
    /// Frame storage or a lower stage failed (includes boundary violations).
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The header size byte is not a valid header length.
    #[error("invalid header size {size} (payload {payload} bytes)")]
    InvalidHeader { size: usize, payload: usize },

    /// The stored header checksum does not match the header contents.
    #[error("header checksum mismatch")]
    BadChecksum,

    /// A SYN parameter block was requested from a header too small to hold one.
    #[error("header of {size} bytes cannot carry SYN parameters")]
    NotSyn { size: usize },

    /// A frame exceeds the negotiated maximum segment size.
    #[error("segment too large ({size} bytes, max {max})")]
    SegmentTooLarge { size: usize, max: usize },

    /// The connection is not established.
    #[error("not connected")]
    NotConnected,

    /// The connection closed while the operation was waiting.
    #[error("connection closed: {0}")]
    Closed(CloseReason),

    /// The send window stayed full for the whole transmit timeout.
    #[error("transmit timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, RssiError>;

/// Errors crossing a stage boundary travel as stream errors.
impl From<RssiError> for StreamError {
    fn from(err: RssiError) -> Self {
        match err {
            RssiError::Stream(inner) => inner,
            RssiError::Closed(_) | RssiError::NotConnected => StreamError::ConnectionClosed,
            RssiError::Timeout(after) => StreamError::Timeout(after),
            RssiError::SegmentTooLarge { size, max } => StreamError::FrameTooLarge { size, max },
            other => StreamError::Protocol(other.to_string()),
        }
    }
}
