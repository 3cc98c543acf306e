mod master;
pub mod v1;

use std::io;

use thiserror::Error;

pub use master::{Master, MasterConfig, RetryPolicy, WriteMode};
pub use v1::{DeviceFault, Instruction, BROADCAST_ID, MAX_ID};

/// Everything that can go wrong during one request/response exchange.
///
/// `Timeout` is kept apart from `Transport`: an absent device is an
/// expected, non-fatal outcome, a failing port is not. The remaining
/// variants classify a malformed or refused status packet; the codec
/// never tries to recover from those, it hands them to the caller.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("serial transport failure")]
    Transport(#[source] io::Error),
    #[error("timed out waiting for a status packet")]
    Timeout,
    #[error("truncated status packet")]
    Incomplete,
    #[error("corrupted status packet framing")]
    Framing,
    #[error("status packet from id {actual}, expected id {expected}")]
    IdMismatch { expected: u8, actual: u8 },
    #[error("status checksum {actual:#04X}, computed {expected:#04X}")]
    Checksum { expected: u8, actual: u8 },
    #[error("device fault: {0}")]
    Device(DeviceFault),
    #[error("id {0} cannot be addressed by this instruction")]
    InvalidId(u8),
    #[error("sync write value for id {id} is {got} bytes, expected {want}")]
    WidthMismatch { id: u8, want: usize, got: usize },
    #[error("parameter block of {0} bytes does not fit the length field")]
    Oversize(usize),
}

impl ProtocolError {
    /// Classifies a failed read. Serial ports report an expired read
    /// deadline as `TimedOut` (`WouldBlock` on some platforms).
    pub(crate) fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProtocolError::Timeout,
            _ => ProtocolError::Transport(err),
        }
    }
}
