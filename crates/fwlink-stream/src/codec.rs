use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Link header: magic (2) + length (4) = 6 bytes.
pub const WIRE_HEADER_SIZE: usize = 6;

/// Magic bytes: "FL" (0x46 0x4C).
pub const MAGIC: [u8; 2] = [0x46, 0x4C];

/// Default maximum frame size on a byte-stream link: 1 MiB.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Encode one frame payload into the byte-stream wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Payload         │
/// │ 0x46 0x4C    │ (4B LE)   │ (Length bytes)  │
/// │ "FL"         │           │                 │
/// └──────────────┴───────────┴─────────────────┘
/// ```
pub fn encode_wire(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(StreamError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(WIRE_HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame payload from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_wire(src: &mut BytesMut, max_frame: usize) -> Result<Option<Bytes>> {
    if src.len() < WIRE_HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(StreamError::InvalidMagic);
    }

    let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if len > max_frame {
        return Err(StreamError::FrameTooLarge {
            size: len,
            max: max_frame,
        });
    }

    if src.len() < WIRE_HEADER_SIZE + len {
        return Ok(None);
    }

    src.advance(WIRE_HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Configuration for a byte-stream link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Maximum frame size in bytes. Default: 1 MiB.
    pub max_frame_size: usize,
    /// Read timeout used to poll for shutdown between reads.
    pub read_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_timeout: Duration::from_millis(50),
        }
    }
}
