use bytes::BytesMut;

use crate::error::{Result, StreamError};

/// Contiguous byte storage with a reserved header region and a payload region.
///
/// Layout:
/// ```text
/// ┌───────────────┬──────────────────────┬─────────────┐
/// │ head room     │ payload              │ tail room   │
/// │ (headers not  │ (logical content)    │ (unused)    │
/// │  yet written) │                      │             │
/// └───────────────┴──────────────────────┴─────────────┘
/// 0           head_room        head_room + payload     raw_size
/// ```
///
/// `head_room + payload <= raw_size` always holds.
#[derive(Debug, Clone)]
pub struct Buffer {
    raw: BytesMut,
    head_room: usize,
    payload: usize,
}

impl Buffer {
    /// Allocate a zeroed buffer of `raw_size` bytes with `head_room` bytes reserved.
    pub fn new(raw_size: usize, head_room: usize) -> Result<Self> {
        if head_room > raw_size {
            return Err(StreamError::Boundary {
                context: "Buffer::new",
                required: head_room,
                available: raw_size,
            });
        }
        Ok(Self {
            raw: BytesMut::zeroed(raw_size),
            head_room,
            payload: 0,
        })
    }

    /// Allocate a zeroed buffer with room for `size` payload bytes behind
    /// `head_room` reserved bytes.
    pub fn reserved(size: usize, head_room: usize) -> Self {
        Self {
            raw: BytesMut::zeroed(head_room + size),
            head_room,
            payload: 0,
        }
    }

    /// Create a buffer whose payload is a copy of `data`, with no head room.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            raw: BytesMut::from(data),
            head_room: 0,
            payload: data.len(),
        }
    }

    /// Total capacity in bytes.
    pub fn raw_size(&self) -> usize {
        self.raw.len()
    }

    /// The full backing storage.
    pub fn raw_data(&self) -> &[u8] {
        &self.raw
    }

    /// The full backing storage, mutably.
    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    /// Bytes reserved in front of the payload.
    pub fn head_room(&self) -> usize {
        self.head_room
    }

    /// Move the head-room boundary, keeping the end of the payload fixed.
    ///
    /// Shrinking the head room exposes reserved bytes as the front of the payload
    /// (a layer writing its header); growing it hides the front of the payload
    /// (a layer stripping its header).
    pub fn set_head_room(&mut self, head_room: usize) -> Result<()> {
        let end = self.head_room + self.payload;
        if head_room > end {
            return Err(StreamError::Boundary {
                context: "Buffer::set_head_room",
                required: head_room,
                available: end,
            });
        }
        self.head_room = head_room;
        self.payload = end - head_room;
        Ok(())
    }

    /// Logical content length.
    pub fn payload(&self) -> usize {
        self.payload
    }

    /// Set the logical content length.
    pub fn set_payload(&mut self, payload: usize) -> Result<()> {
        let available = self.raw.len() - self.head_room;
        if payload > available {
            return Err(StreamError::Boundary {
                context: "Buffer::set_payload",
                required: payload,
                available,
            });
        }
        self.payload = payload;
        Ok(())
    }

    /// Unused bytes after the payload.
    pub fn available(&self) -> usize {
        self.raw.len() - self.head_room - self.payload
    }

    /// The payload region.
    pub fn payload_data(&self) -> &[u8] {
        &self.raw[self.head_room..self.head_room + self.payload]
    }

    /// The payload region, mutably.
    pub fn payload_data_mut(&mut self) -> &mut [u8] {
        let start = self.head_room;
        let end = start + self.payload;
        &mut self.raw[start..end]
    }

    /// Append `data` to the payload.
    pub fn extend_payload(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.available() {
            return Err(StreamError::Boundary {
                context: "Buffer::extend_payload",
                required: data.len(),
                available: self.available(),
            });
        }
        let start = self.head_room + self.payload;
        self.raw[start..start + data.len()].copy_from_slice(data);
        self.payload += data.len();
        Ok(())
    }
}
