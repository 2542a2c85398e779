//! Conventional channel ids.

/// Register transactions (SRP over RSSI).
pub const REGISTER: u8 = 0;
