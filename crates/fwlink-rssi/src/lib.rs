//! Reliable transport for fwlink (RSSI).
//!
//! Adds sequencing, acknowledgment, selective acknowledgment, retransmission
//! and a SYN handshake on top of an unreliable frame stage:
//! - [`Header`] / [`Data`]: the fixed-layout segment header and its data view
//! - [`Controller`]: the connection state machine and its timers
//! - [`Application`]: the endpoint stage with its transmit worker

pub mod application;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod header;

pub use application::Application;
pub use config::{RssiConfig, PROTOCOL_VERSION};
pub use controller::{ConnectionEvent, Controller, ControllerStats, State, StatsSnapshot};
pub use data::Data;
pub use error::{CloseReason, Result, RssiError};
pub use header::{Header, SynParams, HEADER_SIZE, SYN_HEADER_SIZE};
