use std::fmt::Write as _;

use bytes::{Buf, BufMut};
use fwlink_stream::{Buffer, Frame, StreamError};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RssiError};

/// Size of a plain (data, ACK, NUL, RST) header.
pub const HEADER_SIZE: usize = 8;

/// Size of a SYN header carrying the parameter block.
pub const SYN_HEADER_SIZE: usize = 24;

/// Largest header the size byte can describe (kept even).
pub const MAX_HEADER_SIZE: usize = 254;

/// Most selective acknowledgments one EACK header can carry.
pub const MAX_EACKS: usize = (MAX_HEADER_SIZE - HEADER_SIZE) / 2;

pub const FLAG_SYN: u8 = 0x80;
pub const FLAG_ACK: u8 = 0x40;
pub const FLAG_EACK: u8 = 0x20;
pub const FLAG_RST: u8 = 0x10;
pub const FLAG_NUL: u8 = 0x08;
pub const FLAG_BUSY: u8 = 0x01;

const SIZE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const ACK_OFFSET: usize = 2;
const SEQ_OFFSET: usize = 4;
const EXTENSION_OFFSET: usize = 6;

/// Header size needed to carry `count` selective acknowledgments.
pub fn eack_header_size(count: usize) -> usize {
    HEADER_SIZE + 2 * count
}

/// Connection parameters exchanged in SYN segments.
///
/// Layout inside a 24-byte SYN header:
/// ```text
///  6      version            7      reserved
///  8..10  max outstanding    10..12 max segment size
/// 12..14  retransmit ms      14..16 cumulative ack ms
/// 16..18  null timeout ms    18     max retransmissions
/// 19      max cumulative ack 20..22 connection id
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynParams {
    pub version: u8,
    pub max_outstanding: u16,
    pub max_segment_size: u16,
    pub retransmit_timeout_ms: u16,
    pub cumulative_ack_timeout_ms: u16,
    pub null_timeout_ms: u16,
    pub max_retransmissions: u8,
    pub max_cumulative_ack: u8,
    pub connection_id: u16,
}

/// Reliable-transport header over a single-buffer frame.
///
/// The header occupies `size` bytes at `offset` in the buffer, directly in
/// front of the segment data. Multi-byte fields are big-endian:
/// ```text
/// ┌──────┬───────┬────────────┬────────────┬───────────┬──────────┐
/// │ Size │ Flags │ Ack (2B)   │ Seq (2B)   │ Extension │ Checksum │
/// │ (1B) │ (1B)  │            │            │ (size-8)  │ (2B)     │
/// └──────┴───────┴────────────┴────────────┴───────────┴──────────┘
/// ```
/// The checksum is the sum mod 2^16 of every preceding 16-bit header word.
#[derive(Debug, Clone)]
pub struct Header {
    buffer: Buffer,
    offset: usize,
    size: usize,
}

impl Header {
    /// Parse the header at the front of an inbound frame's payload.
    pub fn new(frame: Frame) -> Result<Self> {
        let buffer = frame.into_single("Header::new")?;
        if buffer.payload() < HEADER_SIZE {
            return Err(StreamError::Boundary {
                context: "Header::new",
                required: HEADER_SIZE,
                available: buffer.payload(),
            }
            .into());
        }

        let offset = buffer.head_room();
        let size = buffer.raw_data()[offset + SIZE_OFFSET] as usize;
        if size < HEADER_SIZE || size % 2 != 0 || size > buffer.payload() {
            return Err(RssiError::InvalidHeader {
                size,
                payload: buffer.payload(),
            });
        }
        Ok(Self {
            buffer,
            offset,
            size,
        })
    }

    /// Claim `size` bytes of head room in an outbound frame for a header.
    ///
    /// The header region becomes the front of the payload. Call [`init`] before
    /// setting fields.
    ///
    /// [`init`]: Header::init
    pub fn reserve(frame: Frame, size: usize) -> Result<Self> {
        let mut buffer = frame.into_single("Header::reserve")?;
        if !(HEADER_SIZE..=MAX_HEADER_SIZE).contains(&size) || size % 2 != 0 {
            return Err(RssiError::InvalidHeader {
                size,
                payload: buffer.payload(),
            });
        }
        let head_room = buffer.head_room();
        if head_room < size {
            return Err(StreamError::Boundary {
                context: "Header::reserve",
                required: size,
                available: head_room,
            }
            .into());
        }

        let offset = head_room - size;
        buffer.set_head_room(offset)?;
        Ok(Self {
            buffer,
            offset,
            size,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.buffer.raw_data()[self.offset..self.offset + self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.offset, self.offset + self.size);
        &mut self.buffer.raw_data_mut()[start..end]
    }

    /// Bytes reserved for (or parsed as) the header.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The size byte as stored in the header.
    pub fn header_size(&self) -> u8 {
        self.bytes()[SIZE_OFFSET]
    }

    /// Zero the header and write its size byte.
    pub fn init(&mut self) {
        let size = self.size as u8;
        let bytes = self.bytes_mut();
        bytes.fill(0);
        bytes[SIZE_OFFSET] = size;
    }

    fn compute_checksum(&self) -> u16 {
        let mut words = &self.bytes()[..self.size - 2];
        let mut sum = 0u16;
        while words.remaining() >= 2 {
            sum = sum.wrapping_add(words.get_u16());
        }
        sum
    }

    /// The stored checksum.
    pub fn checksum(&self) -> u16 {
        (&self.bytes()[self.size - 2..]).get_u16()
    }

    /// True when the size byte is consistent and the stored checksum matches.
    pub fn verify(&self) -> bool {
        self.header_size() as usize == self.size && self.compute_checksum() == self.checksum()
    }

    /// Recompute and store the checksum.
    pub fn update(&mut self) {
        let sum = self.compute_checksum();
        let size = self.size;
        (&mut self.bytes_mut()[size - 2..]).put_u16(sum);
    }

    pub fn flags(&self) -> u8 {
        self.bytes()[FLAGS_OFFSET]
    }

    fn flag(&self, mask: u8) -> bool {
        self.flags() & mask != 0
    }

    fn set_flag(&mut self, mask: u8, state: bool) {
        let flags = &mut self.bytes_mut()[FLAGS_OFFSET];
        if state {
            *flags |= mask;
        } else {
            *flags &= !mask;
        }
    }

    pub fn syn(&self) -> bool {
        self.flag(FLAG_SYN)
    }

    pub fn set_syn(&mut self, state: bool) {
        self.set_flag(FLAG_SYN, state);
    }

    pub fn ack(&self) -> bool {
        self.flag(FLAG_ACK)
    }

    pub fn set_ack(&mut self, state: bool) {
        self.set_flag(FLAG_ACK, state);
    }

    pub fn eack(&self) -> bool {
        self.flag(FLAG_EACK)
    }

    pub fn set_eack(&mut self, state: bool) {
        self.set_flag(FLAG_EACK, state);
    }

    pub fn rst(&self) -> bool {
        self.flag(FLAG_RST)
    }

    pub fn set_rst(&mut self, state: bool) {
        self.set_flag(FLAG_RST, state);
    }

    pub fn nul(&self) -> bool {
        self.flag(FLAG_NUL)
    }

    pub fn set_nul(&mut self, state: bool) {
        self.set_flag(FLAG_NUL, state);
    }

    pub fn busy(&self) -> bool {
        self.flag(FLAG_BUSY)
    }

    pub fn set_busy(&mut self, state: bool) {
        self.set_flag(FLAG_BUSY, state);
    }

    pub fn acknowledge(&self) -> u16 {
        (&self.bytes()[ACK_OFFSET..]).get_u16()
    }

    pub fn set_acknowledge(&mut self, ack: u16) {
        (&mut self.bytes_mut()[ACK_OFFSET..]).put_u16(ack);
    }

    pub fn sequence(&self) -> u16 {
        (&self.bytes()[SEQ_OFFSET..]).get_u16()
    }

    pub fn set_sequence(&mut self, seq: u16) {
        (&mut self.bytes_mut()[SEQ_OFFSET..]).put_u16(seq);
    }

    /// Read the SYN parameter block.
    pub fn syn_params(&self) -> Result<SynParams> {
        if self.size < SYN_HEADER_SIZE {
            return Err(RssiError::NotSyn { size: self.size });
        }
        let mut block = &self.bytes()[EXTENSION_OFFSET..];
        let version = block.get_u8();
        block.advance(1);
        Ok(SynParams {
            version,
            max_outstanding: block.get_u16(),
            max_segment_size: block.get_u16(),
            retransmit_timeout_ms: block.get_u16(),
            cumulative_ack_timeout_ms: block.get_u16(),
            null_timeout_ms: block.get_u16(),
            max_retransmissions: block.get_u8(),
            max_cumulative_ack: block.get_u8(),
            connection_id: block.get_u16(),
        })
    }

    /// Write the SYN parameter block.
    pub fn set_syn_params(&mut self, params: &SynParams) -> Result<()> {
        if self.size < SYN_HEADER_SIZE {
            return Err(RssiError::NotSyn { size: self.size });
        }
        let mut block = &mut self.bytes_mut()[EXTENSION_OFFSET..];
        block.put_u8(params.version);
        block.put_u8(0);
        block.put_u16(params.max_outstanding);
        block.put_u16(params.max_segment_size);
        block.put_u16(params.retransmit_timeout_ms);
        block.put_u16(params.cumulative_ack_timeout_ms);
        block.put_u16(params.null_timeout_ms);
        block.put_u8(params.max_retransmissions);
        block.put_u8(params.max_cumulative_ack);
        block.put_u16(params.connection_id);
        Ok(())
    }

    /// Sequence numbers carried by an EACK header.
    pub fn eacks(&self) -> Vec<u16> {
        if !self.eack() {
            return Vec::new();
        }
        let mut list = &self.bytes()[EXTENSION_OFFSET..self.size - 2];
        let mut out = Vec::with_capacity(list.len() / 2);
        while list.remaining() >= 2 {
            out.push(list.get_u16());
        }
        out
    }

    /// Store selective acknowledgments. The header must have been sized with
    /// [`eack_header_size`].
    pub fn set_eacks(&mut self, seqs: &[u16]) -> Result<()> {
        if eack_header_size(seqs.len()) != self.size {
            return Err(RssiError::InvalidHeader {
                size: self.size,
                payload: self.buffer.payload(),
            });
        }
        let size = self.size;
        let mut list = &mut self.bytes_mut()[EXTENSION_OFFSET..size - 2];
        for seq in seqs {
            list.put_u16(*seq);
        }
        Ok(())
    }

    /// Bytes following the header.
    pub(crate) fn trailing(&self) -> &[u8] {
        &self.buffer.payload_data()[self.size..]
    }

    /// Release the frame with the header hidden in head room.
    pub(crate) fn strip(self) -> Result<Frame> {
        let mut buffer = self.buffer;
        buffer.set_head_room(self.offset + self.size)?;
        Ok(Frame::with_buffer(buffer))
    }

    /// Release the whole segment (header and data) as a frame.
    pub fn into_frame(self) -> Frame {
        Frame::with_buffer(self.buffer)
    }

    /// Human-readable breakdown of the header.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "   Total Size : {}", self.buffer.payload());
        let _ = writeln!(out, "  Header Size : {}", self.header_size());
        let _ = write!(out, "   Raw Header :");
        let mut words = self.bytes();
        let mut index = 0;
        while words.remaining() >= 2 {
            if index > 0 && index % 4 == 0 {
                let _ = write!(out, "\n               ");
            }
            let _ = write!(out, " 0x{:04x}", words.get_u16());
            index += 1;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "          Syn : {}", self.syn());
        let _ = writeln!(out, "          Ack : {}", self.ack());
        let _ = writeln!(out, "         EAck : {}", self.eack());
        let _ = writeln!(out, "          Rst : {}", self.rst());
        let _ = writeln!(out, "          Nul : {}", self.nul());
        let _ = writeln!(out, "         Busy : {}", self.busy());
        let _ = writeln!(out, "     Sequence : {}", self.sequence());
        let _ = writeln!(out, "  Acknowledge : {}", self.acknowledge());
        let _ = writeln!(
            out,
            "     Checksum : 0x{:04x} ({})",
            self.checksum(),
            if self.verify() { "ok" } else { "bad" }
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use fwlink_stream::pool;

    use super::*;

    fn fresh(size: usize) -> Header {
        let mut header = Header::reserve(pool::req_frame(0, size), size).unwrap();
        header.init();
        header
    }

    #[test]
    fn ack_only_syn_sized_header() {
        let mut header = fresh(SYN_HEADER_SIZE);
        header.set_ack(true);
        header.set_sequence(5);
        header.set_acknowledge(3);
        header.update();

        assert_eq!(header.header_size(), 24);
        assert_eq!(header.flags(), 0x40);
        assert!(header.ack());
        assert!(!header.syn());
        assert_eq!(header.sequence(), 5);
        assert_eq!(header.acknowledge(), 3);
        assert!(header.verify());
    }

    #[test]
    fn flags_are_isolated() {
        type Get = fn(&Header) -> bool;
        type Set = fn(&mut Header, bool);
        let flags: [(u8, Get, Set); 6] = [
            (FLAG_SYN, Header::syn, Header::set_syn),
            (FLAG_ACK, Header::ack, Header::set_ack),
            (FLAG_EACK, Header::eack, Header::set_eack),
            (FLAG_RST, Header::rst, Header::set_rst),
            (FLAG_NUL, Header::nul, Header::set_nul),
            (FLAG_BUSY, Header::busy, Header::set_busy),
        ];

        for (mask, get, set) in flags {
            let mut header = fresh(HEADER_SIZE);
            set(&mut header, true);
            assert_eq!(header.flags(), mask);
            assert!(get(&header));
            for (other, other_get, _) in flags {
                if other != mask {
                    assert!(!other_get(&header), "flag {other:#04x} leaked from {mask:#04x}");
                }
            }

            // Clearing one flag leaves every other flag set.
            let mut header = fresh(HEADER_SIZE);
            for (_, _, other_set) in flags {
                other_set(&mut header, true);
            }
            set(&mut header, false);
            assert_eq!(header.flags(), 0xF9 & !mask);
        }
    }

    #[test]
    fn any_single_bit_flip_fails_verify() {
        let mut header = fresh(SYN_HEADER_SIZE);
        header.set_syn(true);
        header.set_sequence(0x1234);
        header.set_acknowledge(0xBEEF);
        header
            .set_syn_params(&SynParams {
                version: 1,
                max_outstanding: 32,
                max_segment_size: 1024,
                retransmit_timeout_ms: 100,
                cumulative_ack_timeout_ms: 20,
                null_timeout_ms: 1000,
                max_retransmissions: 15,
                max_cumulative_ack: 2,
                connection_id: 7,
            })
            .unwrap();
        header.update();
        assert!(header.verify());

        let wire = header.into_frame().to_bytes();
        for byte in 0..SYN_HEADER_SIZE {
            for bit in 0..8 {
                let mut corrupt = wire.to_vec();
                corrupt[byte] ^= 1 << bit;
                // A damaged size byte may describe a layout that cannot be parsed.
                let detected = match Header::new(Frame::from_slice(&corrupt)) {
                    Ok(parsed) => !parsed.verify(),
                    Err(_) => true,
                };
                assert!(detected, "flip at byte {byte} bit {bit} not detected");
            }
        }
    }

    #[test]
    fn syn_params_survive_the_wire() {
        let params = SynParams {
            version: 1,
            max_outstanding: 8,
            max_segment_size: 512,
            retransmit_timeout_ms: 50,
            cumulative_ack_timeout_ms: 10,
            null_timeout_ms: 3000,
            max_retransmissions: 4,
            max_cumulative_ack: 3,
            connection_id: 0xA5A5,
        };
        let mut header = fresh(SYN_HEADER_SIZE);
        header.set_syn(true);
        header.set_syn_params(&params).unwrap();
        header.update();

        let parsed = Header::new(Frame::from_slice(&header.into_frame().to_bytes())).unwrap();
        assert!(parsed.verify());
        assert_eq!(parsed.syn_params().unwrap(), params);
    }

    #[test]
    fn syn_params_need_syn_sized_header() {
        let mut header = fresh(HEADER_SIZE);
        assert!(matches!(header.syn_params(), Err(RssiError::NotSyn { size: 8 })));
        let params = SynParams {
            version: 1,
            max_outstanding: 1,
            max_segment_size: 1,
            retransmit_timeout_ms: 1,
            cumulative_ack_timeout_ms: 1,
            null_timeout_ms: 1,
            max_retransmissions: 1,
            max_cumulative_ack: 1,
            connection_id: 1,
        };
        assert!(header.set_syn_params(&params).is_err());
    }

    #[test]
    fn eack_list() {
        let seqs = [7u16, 9, 12];
        let mut header = fresh(eack_header_size(seqs.len()));
        header.set_ack(true);
        header.set_eack(true);
        header.set_eacks(&seqs).unwrap();
        header.update();

        let parsed = Header::new(Frame::from_slice(&header.into_frame().to_bytes())).unwrap();
        assert!(parsed.verify());
        assert_eq!(parsed.eacks(), seqs);
    }

    #[test]
    fn multi_buffer_frame_rejected() {
        let mut frame = Frame::from_slice(&[8, 0, 0, 0, 0, 0, 0, 0]);
        frame.push_buffer(Buffer::from_slice(b"x"));
        assert!(matches!(
            Header::new(frame),
            Err(RssiError::Stream(StreamError::BufferCount { count: 2, .. }))
        ));
    }

    #[test]
    fn undersized_frame_is_a_boundary_error() {
        assert!(matches!(
            Header::new(Frame::from_slice(&[8, 0, 0])),
            Err(RssiError::Stream(StreamError::Boundary { required: 8, available: 3, .. }))
        ));
        assert!(matches!(
            Header::reserve(pool::req_frame(16, 4), HEADER_SIZE),
            Err(RssiError::Stream(StreamError::Boundary { required: 8, available: 4, .. }))
        ));
    }

    #[test]
    fn size_byte_larger_than_payload_rejected() {
        let mut raw = vec![0u8; 10];
        raw[0] = 24;
        assert!(matches!(
            Header::new(Frame::from_slice(&raw)),
            Err(RssiError::InvalidHeader { size: 24, payload: 10 })
        ));
    }

    #[test]
    fn reserve_exposes_header_in_front_of_data() {
        let mut frame = pool::req_frame(3, HEADER_SIZE);
        frame.write(b"abc").unwrap();
        let mut header = Header::reserve(frame, HEADER_SIZE).unwrap();
        header.init();
        header.update();

        assert_eq!(header.trailing(), b"abc");
        let wire = header.into_frame().to_bytes();
        assert_eq!(wire.len(), HEADER_SIZE + 3);
        assert_eq!(wire[0], HEADER_SIZE as u8);
        assert_eq!(&wire[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn dump_lists_fields() {
        let mut header = fresh(HEADER_SIZE);
        header.set_nul(true);
        header.set_sequence(42);
        header.update();
        let text = header.dump();
        assert!(text.contains("Nul : true"));
        assert!(text.contains("Sequence : 42"));
        assert!(text.contains("(ok)"));
    }
}
