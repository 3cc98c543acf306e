//! Protocol v1 frame codec.
//!
//! Wire layout of an instruction packet:
//! `FF FF | id | length | instruction | params.. | checksum`
//! and of a status packet:
//! `FF FF | id | length | error | data.. | checksum`
//! where `length = payload + 2` and the checksum is the complemented
//! 8-bit sum of everything between the header and the checksum byte.

use std::fmt::Display;

use super::ProtocolError;

/// Reserved id addressing every device on the bus. Broadcast
/// instructions receive no reply.
pub const BROADCAST_ID: u8 = 0xFE;
/// Highest individually addressable device id.
pub const MAX_ID: u8 = 0xFD;
/// Largest parameter block the one-byte length field can describe.
pub const MAX_PARAMS: usize = 253;
/// Size of the largest well-formed v1 packet.
pub const MAX_PACKET: usize = 6 + MAX_PARAMS;

const HEADER: [u8; 2] = [0xFF, 0xFF];

/// The supported instruction set. Protocol v2 support would be new
/// variants here, not new opcode constants at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    ReadData,
    WriteData,
    SyncWrite,
}

impl Instruction {
    pub fn opcode(self) -> u8 {
        match self {
            Instruction::Ping => 0x01,
            Instruction::ReadData => 0x02,
            Instruction::WriteData => 0x03,
            Instruction::SyncWrite => 0x83,
        }
    }
}

/// Non-zero error field of a status packet, one bit per fault class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFault(pub u8);

impl DeviceFault {
    pub const INPUT_VOLTAGE: u8 = 1 << 0;
    pub const ANGLE_LIMIT: u8 = 1 << 1;
    pub const OVERHEATING: u8 = 1 << 2;
    pub const RANGE: u8 = 1 << 3;
    pub const CHECKSUM: u8 = 1 << 4;
    pub const OVERLOAD: u8 = 1 << 5;
    pub const INSTRUCTION: u8 = 1 << 6;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

impl Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        static NAMES: &[(u8, &str)] = &[
            (DeviceFault::INPUT_VOLTAGE, "input voltage"),
            (DeviceFault::ANGLE_LIMIT, "angle limit"),
            (DeviceFault::OVERHEATING, "overheating"),
            (DeviceFault::RANGE, "range"),
            (DeviceFault::CHECKSUM, "checksum"),
            (DeviceFault::OVERLOAD, "overload"),
            (DeviceFault::INSTRUCTION, "instruction"),
        ];

        let known: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();

        if known.is_empty() {
            write!(f, "{:#04X}", self.0)
        } else {
            write!(f, "{} ({:#04X})", known.join(", "), self.0)
        }
    }
}

/// Complemented 8-bit sum over everything between header and checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes
        .iter()
        .cloned()
        .fold(0u8, |x, y| x.overflowing_add(y).0)
}

/// Frames one instruction packet into `buffer` and returns the packet
/// length. Deterministic and infallible for any well-formed input; the
/// caller guarantees `params` fits the length field.
pub fn encode_instruction(
    buffer: &mut [u8],
    id: u8,
    instruction: Instruction,
    params: &[u8],
) -> usize {
    assert!(params.len() <= MAX_PARAMS);
    assert!(buffer.len() >= 6 + params.len());

    buffer[0] = HEADER[0];
    buffer[1] = HEADER[1];
    buffer[2] = id;
    buffer[3] = (2 + params.len()) as u8;
    buffer[4] = instruction.opcode();

    buffer[5..5 + params.len()].copy_from_slice(params);

    buffer[5 + params.len()] = checksum(&buffer[2..5 + params.len()]);
    6 + params.len()
}

/// Validates a status packet and returns its data bytes.
///
/// Checks run in a fixed order: overall length, header and declared
/// length, echoed id, device error field, checksum. A non-zero error
/// field is surfaced for every instruction, not just ping.
pub fn decode_status(
    buffer: &[u8],
    expected_id: u8,
    expected_len: usize,
) -> Result<&[u8], ProtocolError> {
    if buffer.len() < 6 + expected_len {
        return Err(ProtocolError::Incomplete);
    }

    if buffer[0..2] != HEADER || usize::from(buffer[3]) != expected_len + 2 {
        return Err(ProtocolError::Framing);
    }

    if buffer[2] != expected_id {
        return Err(ProtocolError::IdMismatch {
            expected: expected_id,
            actual: buffer[2],
        });
    }

    if buffer[4] != 0 {
        return Err(ProtocolError::Device(DeviceFault(buffer[4])));
    }

    let expected = checksum(&buffer[2..5 + expected_len]);
    let actual = buffer[5 + expected_len];
    if expected != actual {
        return Err(ProtocolError::Checksum { expected, actual });
    }

    Ok(&buffer[5..5 + expected_len])
}
