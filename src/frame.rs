//! Encoding and decoding of the fixed-length frames spoken by the electronic load.
//!
//! Every request and every response is exactly [`FRAME_LEN`] bytes:
//!
//! | Byte    | Meaning                                         |
//! |---------|-------------------------------------------------|
//! | `0`     | Sync marker, always [`SYNC`].                   |
//! | `1`     | Reserved, `0x00`.                               |
//! | `2`     | Command code, see [`CommandCode`].              |
//! | `3..25` | Payload. Numeric fields are little-endian.      |
//! | `25`    | Checksum: sum of bytes `0..25`, modulo 256.     |
//!
//! The checksum is a plain additive byte sum. The instrument rejects anything else, so it must
//! not be swapped for a CRC.

use strum_macros::EnumIter;
use thiserror::Error;

/// Length of every frame, request or response.
pub const FRAME_LEN: usize = 26;
/// First byte of every frame.
pub const SYNC: u8 = 0xAA;
/// Offset of the first payload byte.
pub const PAYLOAD_OFFSET: usize = 3;
/// Number of payload bytes between the command code and the checksum.
pub const PAYLOAD_LEN: usize = 22;
/// Offset of the checksum byte.
pub const CHECKSUM_INDEX: usize = FRAME_LEN - 1;

/// Command codes understood by the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u8)]
pub enum CommandCode {
    /// Status frame sent back by the load in answer to set-commands. Never sent by us.
    Status = 0x12,
    /// Remote (`1`) or front-panel (`0`) control.
    SetRemote = 0x20,
    /// Load input on (`1`) or off (`0`).
    SetLoadEnable = 0x21,
    /// Regulation mode, see [`LoadMode`](crate::load::LoadMode).
    SetLoadType = 0x28,
    /// Constant-current setpoint, u32 in units of 0.1 mA.
    SetCurrent = 0x2A,
    /// Constant-voltage setpoint, u32 in units of 1 mV.
    SetVoltage = 0x2C,
    /// Read voltage, current, power and the state registers.
    QueryVcp = 0x5F,
}

impl CommandCode {
    /// Number of payload bytes a request with this command carries.
    pub const fn request_width(self) -> usize {
        match self {
            CommandCode::QueryVcp => 0,
            CommandCode::Status
            | CommandCode::SetRemote
            | CommandCode::SetLoadEnable
            | CommandCode::SetLoadType => 1,
            CommandCode::SetCurrent | CommandCode::SetVoltage => 4,
        }
    }
}

impl From<CommandCode> for u8 {
    fn from(value: CommandCode) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CommandCode as C;
        match value {
            0x12 => Ok(C::Status),
            0x20 => Ok(C::SetRemote),
            0x21 => Ok(C::SetLoadEnable),
            0x28 => Ok(C::SetLoadType),
            0x2A => Ok(C::SetCurrent),
            0x2C => Ok(C::SetVoltage),
            0x5F => Ok(C::QueryVcp),
            other => Err(other),
        }
    }
}

/// Reasons a frame could not be built or accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame must be 26 bytes, got {0}")]
    InvalidLength(usize),
    #[error("Missing sync marker, found {0:#04x}")]
    BadSync(u8),
    #[error("Checksum mismatch: computed {computed:#04x}, frame carries {found:#04x}")]
    BadChecksum { computed: u8, found: u8 },
    #[error("Payload of {got} bytes does not fit {command:?} (max {max})")]
    InvalidPayload {
        command: CommandCode,
        max: usize,
        got: usize,
    },
}

/// A checksum-validated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    command: u8,
    payload: [u8; PAYLOAD_LEN],
}

impl Frame {
    /// Raw command byte. Responses may carry codes we have no name for.
    pub fn command(&self) -> u8 {
        self.command
    }

    /// The command byte interpreted as a known [`CommandCode`].
    pub fn command_code(&self) -> Option<CommandCode> {
        CommandCode::try_from(self.command).ok()
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    /// Read a little-endian u32 at an absolute frame offset.
    pub fn field_u32(&self, offset: usize) -> Option<u32> {
        offset
            .checked_sub(PAYLOAD_OFFSET)
            .and_then(|start| read_u32_le(&self.payload, start))
    }

    /// Serialise back to wire bytes, recomputing the checksum.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = SYNC;
        bytes[2] = self.command;
        bytes[PAYLOAD_OFFSET..CHECKSUM_INDEX].copy_from_slice(&self.payload);
        bytes[CHECKSUM_INDEX] = checksum(&bytes);
        bytes
    }
}

/// Additive checksum over the first 25 bytes of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .take(CHECKSUM_INDEX)
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Build a request frame. Unused payload bytes are zero.
pub fn encode(command: CommandCode, payload: &[u8]) -> Result<[u8; FRAME_LEN], FrameError> {
    let max = command.request_width();
    if payload.len() > max {
        return Err(FrameError::InvalidPayload {
            command,
            max,
            got: payload.len(),
        });
    }

    let mut bytes = [0u8; FRAME_LEN];
    bytes[0] = SYNC;
    bytes[2] = command.into();
    bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
    bytes[CHECKSUM_INDEX] = checksum(&bytes);
    Ok(bytes)
}

/// Validate raw bytes received from the load.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.len() != FRAME_LEN {
        return Err(FrameError::InvalidLength(raw.len()));
    }
    if raw[0] != SYNC {
        return Err(FrameError::BadSync(raw[0]));
    }
    let computed = checksum(raw);
    let found = raw[CHECKSUM_INDEX];
    if computed != found {
        return Err(FrameError::BadChecksum { computed, found });
    }

    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&raw[PAYLOAD_OFFSET..CHECKSUM_INDEX]);
    Ok(Frame {
        command: raw[2],
        payload,
    })
}

/// Interpret four bytes at `offset` as an unsigned little-endian integer.
///
/// Measured quantities are never negative, so no sign handling is done.
pub fn read_u32_le(buffer: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes: [u8; 4] = buffer.get(offset..end)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}
