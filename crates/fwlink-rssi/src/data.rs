use std::ops::{Deref, DerefMut};

use fwlink_stream::Frame;

use crate::error::Result;
use crate::header::{Header, HEADER_SIZE};

/// A data segment: a plain header followed by application bytes.
#[derive(Debug, Clone)]
pub struct Data {
    header: Header,
}

impl Data {
    /// Parse an inbound segment.
    pub fn new(frame: Frame) -> Result<Self> {
        Ok(Self {
            header: Header::new(frame)?,
        })
    }

    /// Claim header room in an outbound frame already holding the data.
    pub fn reserve(frame: Frame) -> Result<Self> {
        Ok(Self {
            header: Header::reserve(frame, HEADER_SIZE)?,
        })
    }

    /// The bytes after the header.
    pub fn data(&self) -> &[u8] {
        self.header.trailing()
    }

    pub fn data_size(&self) -> usize {
        self.data().len()
    }

    /// Hand the data upward with the header moved into head room.
    pub fn into_payload(self) -> Result<Frame> {
        self.header.strip()
    }

    pub fn into_header(self) -> Header {
        self.header
    }
}

impl From<Header> for Data {
    fn from(header: Header) -> Self {
        Self { header }
    }
}

impl Deref for Data {
    type Target = Header;

    fn deref(&self) -> &Header {
        &self.header
    }
}

impl DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Header {
        &mut self.header
    }
}

#[cfg(test)]
mod tests {
    use fwlink_stream::pool;

    use super::*;

    #[test]
    fn outbound_data_then_inbound_payload() {
        let mut frame = pool::req_frame(5, HEADER_SIZE);
        frame.write(b"hello").unwrap();

        let mut out = Data::reserve(frame).unwrap();
        out.init();
        out.set_ack(true);
        out.set_sequence(11);
        out.update();
        assert_eq!(out.data(), b"hello");

        let wire = out.into_header().into_frame().to_bytes();
        let inbound = Data::new(Frame::from_slice(&wire)).unwrap();
        assert!(inbound.verify());
        assert_eq!(inbound.sequence(), 11);
        assert_eq!(inbound.data_size(), 5);

        let payload = inbound.into_payload().unwrap();
        assert_eq!(payload.to_bytes().as_ref(), b"hello");
        assert_eq!(payload.buffer(0).unwrap().head_room(), HEADER_SIZE);
    }

    #[test]
    fn header_only_segment_has_no_data() {
        let mut header = Header::reserve(pool::req_frame(0, HEADER_SIZE), HEADER_SIZE).unwrap();
        header.init();
        header.update();
        let data = Data::from(header);
        assert_eq!(data.data_size(), 0);
        assert!(data.into_payload().unwrap().is_empty());
    }
}
