//! Register access (SRP) for fwlink.
//!
//! A [`Bridge`] turns register reads and writes on [`Block`]s into request
//! frames and completes them when the matching reply comes back; a
//! [`MemoryEmulator`] answers those requests on the device side. Three wire
//! layouts are supported, selected per bridge through [`Version`].

pub mod block;
pub mod bridge;
pub mod codec;
pub mod emulator;
pub mod error;
pub mod transaction;

pub use block::{Block, Completion};
pub use bridge::{Bridge, BridgeConfig};
pub use codec::{Opcode, Reply, Request, Version, STATUS_ADDRESS_ERROR, STATUS_OK};
pub use emulator::MemoryEmulator;
pub use error::{Result, SrpError};
pub use transaction::Transaction;
