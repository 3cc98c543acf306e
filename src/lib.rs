//! Master-side driver for the Dynamixel servo protocol, version 1.
//!
//! The crate is split in two layers. [`protocol::v1`] is the frame codec:
//! pure functions that build instruction packets and validate status
//! packets. [`protocol::Master`] is the command set on top of it; it owns
//! one serial port exclusively and exposes `ping`, `read`, `write` and
//! `sync_write` as synchronous request/response exchanges.
//!
//! The driver is register-agnostic: register addresses (goal position at
//! 0x1E, present position at 0x24, ...) are conventions owned by the
//! caller, as is the composition of multi-byte little-endian values.

pub mod port;
pub mod protocol;

pub use protocol::{Master, MasterConfig, ProtocolError, RetryPolicy, WriteMode};
