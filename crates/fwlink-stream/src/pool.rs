//! Frame allocation.
//!
//! Every layer obtains frames through these helpers; no layer allocates raw
//! storage on its own.

use crate::buffer::Buffer;
use crate::frame::Frame;

/// Allocate a single-buffer frame able to carry `size` payload bytes behind
/// `head_room` reserved header bytes.
pub fn req_frame(size: usize, head_room: usize) -> Frame {
    Frame::with_buffer(Buffer::reserved(size, head_room))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_layout() {
        let frame = req_frame(100, 8);
        let buffer = frame.buffer(0).unwrap();
        assert_eq!(frame.count(), 1);
        assert_eq!(buffer.raw_size(), 108);
        assert_eq!(buffer.head_room(), 8);
        assert_eq!(buffer.payload(), 0);
        assert_eq!(frame.available(), 100);
    }
}
