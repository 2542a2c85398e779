/// Errors raised by frame storage, stage plumbing and physical links.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A header or payload does not fit the space available in a buffer.
    #[error("{context}: boundary violation (required {required} bytes, available {available})")]
    Boundary {
        context: &'static str,
        required: usize,
        available: usize,
    },

    /// A layer that requires single-buffer framing was handed something else.
    #[error("{context}: frame must contain a single buffer (found {count})")]
    BufferCount { context: &'static str, count: usize },

    /// The link header contains an invalid magic number.
    #[error("invalid link magic (expected 0x464c \"FL\")")]
    InvalidMagic,

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An I/O error occurred on the physical link.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link was closed by the peer.
    #[error("link closed")]
    ConnectionClosed,

    /// The stage was stopped while the operation was waiting.
    #[error("stage cancelled")]
    Cancelled,

    /// A stage could not accept the frame in time.
    #[error("stage timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A protocol stage refused the frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
