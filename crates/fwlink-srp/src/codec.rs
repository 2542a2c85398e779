//! Request and reply layouts for the supported protocol versions.
//!
//! All words are little-endian.
//!
//! - [`Version::V0`]: `tid`, `opcode[31:30] | word_address[29:0]`, then
//!   `count - 1` for reads or the data words for writes, then a zero word.
//!   Replies echo the first two words, carry the data and end with a status word.
//! - [`Version::V3`]: a five word header (`0x03 | opcode << 8`, `tid`,
//!   address low, address high, `size - 1`), write data after it. Replies repeat
//!   the header, carry the data and end with a status word.
//! - [`Version::Default`]: `tid: u32`, `flags: u32` (bit 0 write, bit 1 posted),
//!   `address: u64`, `size: u32`, then write data. Replies add `status: u32`
//!   after `size` and carry data only for reads.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrpError};

/// Status value of a successful reply.
pub const STATUS_OK: u32 = 0;
/// Status the emulator reports for accesses outside its memory.
pub const STATUS_ADDRESS_ERROR: u32 = 0x0000_0001;

const V0_HEADER: usize = 8;
const V3_HEADER: usize = 20;
const DEFAULT_REQUEST_HEADER: usize = 20;
const DEFAULT_REPLY_HEADER: usize = 24;
const STATUS_SIZE: usize = 4;
const V3_VERSION: u32 = 0x03;
const FLAG_WRITE: u32 = 0x1;
const FLAG_POSTED: u32 = 0x2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Version {
    #[default]
    Default,
    V0,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Read,
    Write,
    PostedWrite,
}

impl Opcode {
    pub fn from_flags(write: bool, posted: bool) -> Self {
        match (write, posted) {
            (false, _) => Opcode::Read,
            (true, false) => Opcode::Write,
            (true, true) => Opcode::PostedWrite,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Opcode::Write | Opcode::PostedWrite)
    }

    pub fn expects_reply(self) -> bool {
        self != Opcode::PostedWrite
    }
}

/// A request as the device sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub tid: u32,
    pub opcode: Opcode,
    pub address: u64,
    pub size: usize,
    /// Write data; empty for reads.
    pub data: Bytes,
}

/// A reply as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub tid: u32,
    pub address: u64,
    pub data: Bytes,
    pub status: u32,
}

impl Version {
    /// Map a numeric protocol version; anything but 0 and 3 is the default layout.
    pub fn from_number(number: u32) -> Self {
        match number {
            0 => Version::V0,
            3 => Version::V3,
            _ => Version::Default,
        }
    }

    /// Check that `address` and `size` can be expressed in this version.
    pub fn validate(self, address: u64, size: usize) -> Result<()> {
        if size == 0 {
            return Err(SrpError::UnsupportedAlignment { address, size });
        }
        let aligned = address % 4 == 0 && size % 4 == 0;
        let fits = match self {
            Version::V0 => aligned && address >> 2 <= 0x3FFF_FFFF && size / 4 <= u32::MAX as usize,
            Version::V3 => aligned && size <= u32::MAX as usize,
            Version::Default => size <= u32::MAX as usize,
        };
        if fits {
            Ok(())
        } else {
            Err(SrpError::UnsupportedAlignment { address, size })
        }
    }

    pub fn request_size(self, opcode: Opcode, size: usize) -> usize {
        let data = if opcode.is_write() { size } else { 0 };
        match self {
            Version::V0 if opcode.is_write() => V0_HEADER + data + 4,
            Version::V0 => V0_HEADER + 8,
            Version::V3 => V3_HEADER + data,
            Version::Default => DEFAULT_REQUEST_HEADER + data,
        }
    }

    pub fn reply_size(self, opcode: Opcode, size: usize) -> usize {
        match self {
            Version::V0 => V0_HEADER + size + STATUS_SIZE,
            Version::V3 => V3_HEADER + size + STATUS_SIZE,
            Version::Default if opcode.is_write() => DEFAULT_REPLY_HEADER,
            Version::Default => DEFAULT_REPLY_HEADER + size,
        }
    }

    /// Transaction id of a reply, if the message is long enough to carry one.
    pub fn extract_tid(self, src: &[u8]) -> Option<u32> {
        let offset = match self {
            Version::V3 => 4,
            Version::V0 | Version::Default => 0,
        };
        let word = src.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }

    pub fn encode_request(self, request: &Request, dst: &mut impl BufMut) {
        match self {
            Version::V0 => {
                dst.put_u32_le(request.tid);
                dst.put_u32_le(v0_word(request.opcode, request.address));
                if request.opcode.is_write() {
                    dst.put_slice(&request.data);
                } else {
                    dst.put_u32_le((request.size / 4).saturating_sub(1) as u32);
                }
                dst.put_u32_le(0);
            }
            Version::V3 => {
                put_v3_header(dst, request.opcode, request.tid, request.address, request.size);
                if request.opcode.is_write() {
                    dst.put_slice(&request.data);
                }
            }
            Version::Default => {
                dst.put_u32_le(request.tid);
                dst.put_u32_le(default_flags(request.opcode));
                dst.put_u64_le(request.address);
                dst.put_u32_le(request.size as u32);
                if request.opcode.is_write() {
                    dst.put_slice(&request.data);
                }
            }
        }
    }

    pub fn decode_request(self, src: &[u8]) -> Result<Request> {
        match self {
            Version::V0 => {
                need(src, V0_HEADER + 4)?;
                let mut cur = src;
                let tid = cur.get_u32_le();
                let word = cur.get_u32_le();
                let address = u64::from(word & 0x3FFF_FFFF) << 2;
                match word >> 30 {
                    0 => {
                        need(src, V0_HEADER + 8)?;
                        let count = cur.get_u32_le() as usize + 1;
                        Ok(Request {
                            tid,
                            opcode: Opcode::Read,
                            address,
                            size: count * 4,
                            data: Bytes::new(),
                        })
                    }
                    1 => {
                        let data = &src[V0_HEADER..src.len() - 4];
                        if data.is_empty() || data.len() % 4 != 0 {
                            return Err(SrpError::Malformed("write data is not whole words"));
                        }
                        Ok(Request {
                            tid,
                            opcode: Opcode::Write,
                            address,
                            size: data.len(),
                            data: Bytes::copy_from_slice(data),
                        })
                    }
                    other => Err(SrpError::UnsupportedOpcode(other)),
                }
            }
            Version::V3 => {
                let (opcode, tid, address, size) = get_v3_header(src)?;
                let data = if opcode.is_write() {
                    let data = &src[V3_HEADER..];
                    if data.len() != size {
                        return Err(SrpError::SizeMismatch {
                            expected: size,
                            actual: data.len(),
                        });
                    }
                    Bytes::copy_from_slice(data)
                } else {
                    Bytes::new()
                };
                Ok(Request {
                    tid,
                    opcode,
                    address,
                    size,
                    data,
                })
            }
            Version::Default => {
                need(src, DEFAULT_REQUEST_HEADER)?;
                let mut cur = src;
                let tid = cur.get_u32_le();
                let flags = cur.get_u32_le();
                let address = cur.get_u64_le();
                let size = cur.get_u32_le() as usize;
                let opcode = Opcode::from_flags(flags & FLAG_WRITE != 0, flags & FLAG_POSTED != 0);
                let data = if opcode.is_write() {
                    if cur.len() != size {
                        return Err(SrpError::SizeMismatch {
                            expected: size,
                            actual: cur.len(),
                        });
                    }
                    Bytes::copy_from_slice(cur)
                } else {
                    Bytes::new()
                };
                Ok(Request {
                    tid,
                    opcode,
                    address,
                    size,
                    data,
                })
            }
        }
    }

    /// Serialize the reply to `request`. `data` is the read result; writes echo
    /// their own data where the layout carries it.
    pub fn encode_reply(self, request: &Request, data: &[u8], status: u32) -> Bytes {
        let body: &[u8] = if request.opcode.is_write() {
            &request.data
        } else {
            data
        };
        let mut dst = BytesMut::with_capacity(self.reply_size(request.opcode, body.len()));
        match self {
            Version::V0 => {
                dst.put_u32_le(request.tid);
                dst.put_u32_le(v0_word(request.opcode, request.address));
                dst.put_slice(body);
                dst.put_u32_le(status);
            }
            Version::V3 => {
                put_v3_header(&mut dst, request.opcode, request.tid, request.address, request.size);
                dst.put_slice(body);
                dst.put_u32_le(status);
            }
            Version::Default => {
                dst.put_u32_le(request.tid);
                dst.put_u32_le(default_flags(request.opcode));
                dst.put_u64_le(request.address);
                dst.put_u32_le(request.size as u32);
                dst.put_u32_le(status);
                if !request.opcode.is_write() {
                    dst.put_slice(body);
                }
            }
        }
        dst.freeze()
    }

    pub fn decode_reply(self, src: &[u8]) -> Result<Reply> {
        match self {
            Version::V0 => {
                need(src, V0_HEADER + STATUS_SIZE)?;
                let mut cur = src;
                let tid = cur.get_u32_le();
                let word = cur.get_u32_le();
                let status = read_footer(src);
                Ok(Reply {
                    tid,
                    address: u64::from(word & 0x3FFF_FFFF) << 2,
                    data: Bytes::copy_from_slice(&src[V0_HEADER..src.len() - STATUS_SIZE]),
                    status,
                })
            }
            Version::V3 => {
                need(src, V3_HEADER + STATUS_SIZE)?;
                let (_, tid, address, _) = get_v3_header(src)?;
                Ok(Reply {
                    tid,
                    address,
                    data: Bytes::copy_from_slice(&src[V3_HEADER..src.len() - STATUS_SIZE]),
                    status: read_footer(src),
                })
            }
            Version::Default => {
                need(src, DEFAULT_REPLY_HEADER)?;
                let mut cur = src;
                let tid = cur.get_u32_le();
                let _flags = cur.get_u32_le();
                let address = cur.get_u64_le();
                let _size = cur.get_u32_le();
                let status = cur.get_u32_le();
                Ok(Reply {
                    tid,
                    address,
                    data: Bytes::copy_from_slice(cur),
                    status,
                })
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Version::Default => "default",
            Version::V0 => "v0",
            Version::V3 => "v3",
        })
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Version::Default),
            "v0" | "0" => Ok(Version::V0),
            "v3" | "3" => Ok(Version::V3),
            other => Err(format!(
                "unknown protocol version '{other}' (expected default, v0 or v3)"
            )),
        }
    }
}

fn need(src: &[u8], expected: usize) -> Result<()> {
    if src.len() < expected {
        return Err(SrpError::FrameTooShort {
            expected,
            actual: src.len(),
        });
    }
    Ok(())
}

fn read_footer(src: &[u8]) -> u32 {
    let mut tail = &src[src.len() - STATUS_SIZE..];
    tail.get_u32_le()
}

fn v0_word(opcode: Opcode, address: u64) -> u32 {
    let op = if opcode.is_write() { 1 } else { 0 };
    (op << 30) | ((address >> 2) as u32 & 0x3FFF_FFFF)
}

fn default_flags(opcode: Opcode) -> u32 {
    match opcode {
        Opcode::Read => 0,
        Opcode::Write => FLAG_WRITE,
        Opcode::PostedWrite => FLAG_WRITE | FLAG_POSTED,
    }
}

fn put_v3_header(dst: &mut impl BufMut, opcode: Opcode, tid: u32, address: u64, size: usize) {
    let op = match opcode {
        Opcode::Read => 0,
        Opcode::Write => 1,
        Opcode::PostedWrite => 2,
    };
    dst.put_u32_le(V3_VERSION | (op << 8));
    dst.put_u32_le(tid);
    dst.put_u32_le(address as u32);
    dst.put_u32_le((address >> 32) as u32);
    dst.put_u32_le(size.saturating_sub(1) as u32);
}

fn get_v3_header(src: &[u8]) -> Result<(Opcode, u32, u64, usize)> {
    need(src, V3_HEADER)?;
    let mut cur = src;
    let word0 = cur.get_u32_le();
    if word0 & 0xFF != V3_VERSION {
        return Err(SrpError::Malformed("version field is not 3"));
    }
    let opcode = match (word0 >> 8) & 0x3 {
        0 => Opcode::Read,
        1 => Opcode::Write,
        2 => Opcode::PostedWrite,
        other => return Err(SrpError::UnsupportedOpcode(other)),
    };
    let tid = cur.get_u32_le();
    let low = u64::from(cur.get_u32_le());
    let high = u64::from(cur.get_u32_le());
    let size = cur.get_u32_le() as usize + 1;
    Ok((opcode, tid, (high << 32) | low, size))
}
