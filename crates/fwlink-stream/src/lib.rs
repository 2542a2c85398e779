//! Frame and buffer primitives shared by every fwlink layer.
//!
//! This is the lowest layer of fwlink. It owns the byte storage that the
//! protocol layers wrap and unwrap, and the plumbing that stacks them:
//! - [`Frame`] / [`Buffer`]: owned byte storage with head-room and payload markers
//! - [`FrameTx`] / [`FrameRx`] / [`Master`]: the downward and upward stage interfaces
//! - [`Worker`] / [`CancelToken`]: dedicated threads with cooperative shutdown
//! - [`StreamLink`]: a physical link over any byte stream (TCP, Unix sockets)

pub mod buffer;
pub mod codec;
pub mod error;
pub mod frame;
pub mod link;
pub mod pool;
pub mod stage;
pub mod worker;

pub use buffer::Buffer;
pub use codec::{decode_wire, encode_wire, LinkConfig, DEFAULT_MAX_FRAME, WIRE_HEADER_SIZE};
pub use error::{Result, StreamError};
pub use frame::Frame;
pub use link::{LinkStream, StreamLink};
pub use pool::req_frame;
pub use stage::{FrameRx, FrameTx, Master};
pub use worker::{CancelToken, Worker};
