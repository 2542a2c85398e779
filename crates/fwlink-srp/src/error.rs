use std::time::Duration;

use fwlink_stream::StreamError;

/// Errors raised while issuing or answering register transactions.
#[derive(Debug, thiserror::Error)]
pub enum SrpError {
    /// Frame storage or the lower stage failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A message is shorter than its fixed fields.
    #[error("message too short ({actual} bytes, need at least {expected})")]
    FrameTooShort { expected: usize, actual: usize },

    /// A message field is inconsistent with the protocol.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The opcode is not one this protocol version defines.
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u32),

    /// The reply carries a different amount of data than the block expects.
    #[error("size mismatch (expected {expected} bytes, got {actual})")]
    SizeMismatch { expected: usize, actual: usize },

    /// The device reported an error status.
    #[error("transaction failed with status {0:#010x}")]
    Status(u32),

    /// The address or size is not word aligned where the protocol requires it.
    #[error("address {address:#x} / size {size} not supported by this protocol version")]
    UnsupportedAlignment { address: u64, size: usize },

    /// No reply arrived in time.
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, SrpError>;
