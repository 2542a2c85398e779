use bytes::{Buf, BufMut, Bytes};
use fwlink_stream::{pool, Frame};

use crate::error::{PacketizerError, Result};

/// Packet header: flags (1) + channel (1) + sequence (2) + CRC (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Packet format version carried in the low nibble of the flag byte.
pub const VERSION: u8 = 1;

const FLAG_SOF: u8 = 0x80;
const FLAG_EOF: u8 = 0x40;
const VERSION_MASK: u8 = 0x0F;

/// Bytes covered by the CRC ahead of the payload.
const CRC_PREFIX: usize = 4;

/// Routing and ordering information of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u8,
    pub sequence: u16,
    /// First packet of a frame.
    pub sof: bool,
    /// Last packet of a frame.
    pub eof: bool,
}

impl PacketHeader {
    fn flag_byte(&self) -> u8 {
        let mut flags = VERSION;
        if self.sof {
            flags |= FLAG_SOF;
        }
        if self.eof {
            flags |= FLAG_EOF;
        }
        flags
    }
}

/// A validated inbound packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

fn compute_crc(prefix: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(prefix);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode one packet into a fresh single-buffer frame.
///
/// Wire format:
/// ```text
/// ┌─────────┬─────────┬────────────┬──────────┬───────────────┐
/// │ Flags   │ Channel │ Sequence   │ CRC32    │ Payload       │
/// │ (1B)    │ (1B)    │ (2B LE)    │ (4B LE)  │               │
/// │ SOF|EOF │         │            │          │               │
/// │ |ver    │         │            │          │               │
/// └─────────┴─────────┴────────────┴──────────┴───────────────┘
/// ```
/// The CRC covers the first four header bytes and the payload.
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Result<Frame> {
    let mut frame = pool::req_frame(payload.len(), HEADER_SIZE);
    frame.write(payload)?;

    let buffer = frame.single_mut("encode_packet")?;
    buffer.set_head_room(0)?;
    let data = buffer.payload_data_mut();

    let mut prefix = &mut data[..CRC_PREFIX];
    prefix.put_u8(header.flag_byte());
    prefix.put_u8(header.channel);
    prefix.put_u16_le(header.sequence);

    let crc = compute_crc(&data[..CRC_PREFIX], &data[HEADER_SIZE..]);
    let mut tail = &mut data[CRC_PREFIX..HEADER_SIZE];
    tail.put_u32_le(crc);

    Ok(frame)
}

/// Decode and validate one packet.
pub fn decode_packet(frame: &Frame) -> Result<Packet> {
    let bytes = frame.to_bytes();
    if bytes.len() < HEADER_SIZE {
        return Err(PacketizerError::Truncated { size: bytes.len() });
    }

    let mut head = &bytes[..HEADER_SIZE];
    let flags = head.get_u8();
    let channel = head.get_u8();
    let sequence = head.get_u16_le();
    let stored = head.get_u32_le();

    let computed = compute_crc(&bytes[..CRC_PREFIX], &bytes[HEADER_SIZE..]);
    if stored != computed {
        return Err(PacketizerError::CrcMismatch {
            channel,
            stored,
            computed,
        });
    }

    let version = flags & VERSION_MASK;
    if version != VERSION {
        return Err(PacketizerError::UnsupportedVersion(version));
    }

    Ok(Packet {
        header: PacketHeader {
            channel,
            sequence,
            sof: flags & FLAG_SOF != 0,
            eof: flags & FLAG_EOF != 0,
        },
        payload: bytes.slice(HEADER_SIZE..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(channel: u8, sequence: u16) -> PacketHeader {
        PacketHeader {
            channel,
            sequence,
            sof: true,
            eof: false,
        }
    }

    #[test]
    fn header_layout() {
        let frame = encode_packet(&header(5, 0x0102), b"abc").unwrap();
        let bytes = frame.to_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(bytes[0], 0x80 | VERSION);
        assert_eq!(bytes[1], 5);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
        assert_eq!(&bytes[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn decode_recovers_header_and_payload() {
        let sent = PacketHeader {
            channel: 9,
            sequence: 65535,
            sof: false,
            eof: true,
        };
        let frame = encode_packet(&sent, b"tail").unwrap();
        let packet = decode_packet(&frame).unwrap();

        assert_eq!(packet.header, sent);
        assert_eq!(packet.payload.as_ref(), b"tail");
    }

    #[test]
    fn empty_payload_allowed() {
        let frame = encode_packet(&header(0, 0), b"").unwrap();
        let packet = decode_packet(&frame).unwrap();
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let frame = encode_packet(&header(2, 7), b"payload").unwrap();
        let mut bytes = frame.to_bytes().to_vec();
        bytes[HEADER_SIZE + 1] ^= 0x10;

        let err = decode_packet(&Frame::from_slice(&bytes)).unwrap_err();
        assert!(matches!(err, PacketizerError::CrcMismatch { channel: 2, .. }));
    }

    #[test]
    fn corrupted_sequence_fails_crc() {
        let frame = encode_packet(&header(2, 7), b"payload").unwrap();
        let mut bytes = frame.to_bytes().to_vec();
        bytes[2] ^= 0x01;

        assert!(matches!(
            decode_packet(&Frame::from_slice(&bytes)),
            Err(PacketizerError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncated_packet_rejected() {
        let err = decode_packet(&Frame::from_slice(&[0x81, 0, 0])).unwrap_err();
        assert!(matches!(err, PacketizerError::Truncated { size: 3 }));
    }
}
