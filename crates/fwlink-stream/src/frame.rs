use bytes::{Bytes, BytesMut};

use crate::buffer::Buffer;
use crate::error::{Result, StreamError};

/// One logical message: an ordered sequence of buffers.
///
/// A frame is owned by whichever stage currently holds it and is moved, not
/// shared, when handed to the next stage.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    buffers: Vec<Buffer>,
}

impl Frame {
    /// Create an empty frame with no buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame holding a single buffer.
    pub fn with_buffer(buffer: Buffer) -> Self {
        Self {
            buffers: vec![buffer],
        }
    }

    /// Create a single-buffer frame whose payload is a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::with_buffer(Buffer::from_slice(data))
    }

    /// Append a buffer to the frame.
    pub fn push_buffer(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Number of buffers.
    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    /// Borrow buffer `index`.
    pub fn buffer(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }

    /// Mutably borrow buffer `index`.
    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut Buffer> {
        self.buffers.get_mut(index)
    }

    /// Iterate over the buffers in order.
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    /// Total payload bytes across all buffers.
    pub fn payload(&self) -> usize {
        self.buffers.iter().map(Buffer::payload).sum()
    }

    /// True when the frame carries no payload bytes.
    pub fn is_empty(&self) -> bool {
        self.payload() == 0
    }

    /// Unused tail room across all buffers.
    pub fn available(&self) -> usize {
        self.buffers.iter().map(Buffer::available).sum()
    }

    /// Append `data` to the payload, filling buffers in order.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if data.len() > self.available() {
            return Err(StreamError::Boundary {
                context: "Frame::write",
                required: data.len(),
                available: self.available(),
            });
        }
        for buffer in &mut self.buffers {
            if data.is_empty() {
                break;
            }
            let n = buffer.available().min(data.len());
            buffer.extend_payload(&data[..n])?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Copy the concatenated payload into one contiguous block.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.payload());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer.payload_data());
        }
        out.freeze()
    }

    /// Require single-buffer framing and return that buffer.
    pub fn single(&self, context: &'static str) -> Result<&Buffer> {
        match self.buffers.as_slice() {
            [buffer] => Ok(buffer),
            other => Err(StreamError::BufferCount {
                context,
                count: other.len(),
            }),
        }
    }

    /// Require single-buffer framing and take that buffer out of the frame.
    pub fn into_single(self, context: &'static str) -> Result<Buffer> {
        let count = self.buffers.len();
        match <[Buffer; 1]>::try_from(self.buffers) {
            Ok([buffer]) => Ok(buffer),
            Err(_) => Err(StreamError::BufferCount { context, count }),
        }
    }

    /// Require single-buffer framing and return that buffer mutably.
    pub fn single_mut(&mut self, context: &'static str) -> Result<&mut Buffer> {
        match self.buffers.as_mut_slice() {
            [buffer] => Ok(buffer),
            other => Err(StreamError::BufferCount {
                context,
                count: other.len(),
            }),
        }
    }
}
