//! Driver for the electronic load.
//!
//! Commands are exchanged as fixed 26-byte frames (see [`crate::frame`]). Every command is a
//! strict request/response pair: one frame out, exactly one frame back. The load answers
//! set-commands with a [`CommandCode::Status`] frame and queries with a frame echoing the query
//! code.

use modular_bitfield::prelude::*;
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    frame::{self, CommandCode, FRAME_LEN, Frame},
    transport,
    types::{Measurement, State},
};

/// Raw voltage fields are in millivolts.
pub const VOLTAGE_SCALE: f32 = 1000.0;
/// Raw current fields are in units of 0.1 mA.
pub const CURRENT_SCALE: f32 = 10000.0;
/// Raw power fields are in milliwatts.
pub const POWER_SCALE: f32 = 1000.0;

const VOLTAGE_OFFSET: usize = 3;
const CURRENT_OFFSET: usize = 7;
const POWER_OFFSET: usize = 11;
const OPERATION_STATE_OFFSET: usize = 15;
const DEMAND_STATE_OFFSET: usize = 16;

/// Result code carried in byte 3 of a status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    ChecksumError,
    ParameterError,
    CannotExecute,
    InvalidCommand,
    Unknown(u8),
}

impl From<u8> for ResponseStatus {
    fn from(value: u8) -> Self {
        match value {
            0x80 => ResponseStatus::Success,
            0x90 => ResponseStatus::ChecksumError,
            0xA0 => ResponseStatus::ParameterError,
            0xB0 => ResponseStatus::CannotExecute,
            0xC0 => ResponseStatus::InvalidCommand,
            other => ResponseStatus::Unknown(other),
        }
    }
}

/// Regulation mode selected with [`LoadController::set_load_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoadMode {
    #[default]
    ConstantCurrent = 0x00,
    ConstantVoltage = 0x01,
    ConstantPower = 0x02,
    ConstantResistance = 0x03,
}

/// "Operation state register", byte 15 of a VCP response.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationState {
    pub calibrating: bool,
    pub waiting_for_trigger: bool,
    pub remote: bool,
    pub input_on: bool,
    pub local_key: bool,
    pub remote_sense: bool,
    pub load_on_timer: bool,
    #[skip]
    __: B1,
}

/// "Demand state register", bytes 16-17 of a VCP response.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemandState {
    pub reverse_voltage: bool,
    pub over_voltage: bool,
    pub over_current: bool,
    pub over_power: bool,
    pub over_temperature: bool,
    pub sense_disconnected: bool,
    pub constant_current: bool,
    pub constant_voltage: bool,
    pub constant_power: bool,
    pub constant_resistance: bool,
    #[skip]
    __: B6,
}

/// Everything a single VCP query returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadStatus {
    pub measurement: Measurement,
    pub operation: OperationState,
    pub demand: DemandState,
}

impl LoadStatus {
    fn from_frame(reply: &Frame) -> Option<Self> {
        let voltage = reply.field_u32(VOLTAGE_OFFSET)?;
        let current = reply.field_u32(CURRENT_OFFSET)?;
        let power = reply.field_u32(POWER_OFFSET)?;
        let payload = reply.payload();
        let operation = payload[OPERATION_STATE_OFFSET - frame::PAYLOAD_OFFSET];
        let demand_start = DEMAND_STATE_OFFSET - frame::PAYLOAD_OFFSET;
        let demand = [payload[demand_start], payload[demand_start + 1]];

        Some(Self {
            measurement: Measurement {
                voltage: (voltage as f64 / VOLTAGE_SCALE as f64) as f32,
                current: (current as f64 / CURRENT_SCALE as f64) as f32,
                power: (power as f64 / POWER_SCALE as f64) as f32,
            },
            operation: OperationState::from_bytes([operation]),
            demand: DemandState::from_bytes(demand),
        })
    }
}

/// Scale a physical setpoint into its wire integer, truncating toward zero.
fn scale_setpoint(value: f32, scale: f32) -> Option<u32> {
    let scaled = value * scale;
    if !scaled.is_finite() || scaled < 0.0 || scaled >= 4_294_967_296.0 {
        return None;
    }
    Some(scaled as u32)
}

/// You can create a LoadController using any interface which implements [embedded_io::Read],
/// [embedded_io::ReadReady] & [embedded_io::Write].
///
/// Construction is split in two: [`Self::new`] only takes ownership of the link, and
/// [`Self::set_remote`] negotiates programmatic control. [`Self::connect`] does both.
///
/// Dropping a controller that was not [closed](Self::close) hands the front panel back to the
/// operator on a best-effort basis.
pub struct LoadController<S: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write> {
    interface: S,
    remote: bool,
    closed: bool,
}

impl<S: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write> LoadController<S> {
    /// Wrap an already opened link. No bytes are exchanged.
    pub fn new(interface: S) -> Self {
        Self {
            interface,
            remote: false,
            closed: false,
        }
    }

    /// Wrap `interface` and switch the load to remote control.
    pub fn connect(interface: S) -> Result<Self, S::Error> {
        let mut load = Self::new(interface);
        load.set_remote()?;
        Ok(load)
    }

    /// Whether the last mode negotiation left the load in remote control.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Take programmatic control of the load.
    pub fn set_remote(&mut self) -> Result<(), S::Error> {
        self.transact(CommandCode::SetRemote, &[State::On as u8])?;
        self.remote = true;
        debug!("load switched to remote control");
        Ok(())
    }

    /// Return control to the front panel.
    pub fn set_local(&mut self) -> Result<(), S::Error> {
        self.transact(CommandCode::SetRemote, &[State::Off as u8])?;
        self.remote = false;
        debug!("load returned to local control");
        Ok(())
    }

    /// Turn the load input on or off.
    pub fn set_load_enabled(&mut self, state: impl Into<State>) -> Result<(), S::Error> {
        let state = state.into();
        self.transact(CommandCode::SetLoadEnable, &[state as u8])?;
        Ok(())
    }

    /// Select the regulation mode.
    pub fn set_load_mode(&mut self, mode: LoadMode) -> Result<(), S::Error> {
        self.transact(CommandCode::SetLoadType, &[mode as u8])?;
        Ok(())
    }

    /// Set the constant-current level in amps.
    ///
    /// The value is multiplied by 10000 and truncated, so `1.23459` is sent as `12345`.
    pub fn set_current(&mut self, amps: f32) -> Result<(), S::Error> {
        let raw = scale_setpoint(amps, CURRENT_SCALE).ok_or(Error::InvalidRange)?;
        self.transact(CommandCode::SetCurrent, &raw.to_le_bytes())?;
        Ok(())
    }

    /// Set the constant-voltage level in volts, truncated to whole millivolts.
    pub fn set_voltage(&mut self, volts: f32) -> Result<(), S::Error> {
        let raw = scale_setpoint(volts, VOLTAGE_SCALE).ok_or(Error::InvalidRange)?;
        self.transact(CommandCode::SetVoltage, &raw.to_le_bytes())?;
        Ok(())
    }

    /// Query voltage, current, power and both state registers.
    pub fn read_status(&mut self) -> Result<LoadStatus, S::Error> {
        let reply = self.transact(CommandCode::QueryVcp, &[])?;
        if reply.command_code() != Some(CommandCode::QueryVcp) {
            return Err(Error::UnexpectedResponse {
                expected: CommandCode::QueryVcp.into(),
                found: reply.command(),
            });
        }
        LoadStatus::from_frame(&reply).ok_or(Error::InvalidResponse)
    }

    /// Return the measured voltage (V), current (A) and power (W).
    pub fn read_measurement(&mut self) -> Result<Measurement, S::Error> {
        Ok(self.read_status()?.measurement)
    }

    /// Return the load to local control and release the link.
    pub fn close(mut self) -> Result<(), S::Error> {
        self.closed = true;
        self.set_local()
    }

    /// Send one request frame and wait for its response.
    pub fn transact(&mut self, command: CommandCode, payload: &[u8]) -> Result<Frame, S::Error> {
        let request = frame::encode(command, payload)?;
        trace!(?command, ?request, "load request");

        // A late response to an earlier request would otherwise be taken as this one's.
        let stale = transport::discard_input(&mut self.interface).map_err(Error::Serial)?;
        if stale > 0 {
            warn!(bytes = stale, "discarded late load response");
        }

        let written = self.write_frame(&request)?;
        if written != FRAME_LEN {
            return Err(Error::ShortWrite {
                written,
                expected: FRAME_LEN,
            });
        }

        let mut response = [0u8; FRAME_LEN];
        let read = self.read_frame(&mut response)?;
        if read != FRAME_LEN {
            return Err(Error::ShortRead {
                read,
                expected: FRAME_LEN,
            });
        }
        trace!(?response, "load response");

        let reply = frame::decode(&response)?;
        match reply.command_code() {
            Some(CommandCode::Status) => match ResponseStatus::from(reply.payload()[0]) {
                ResponseStatus::Success => Ok(reply),
                status => Err(Error::Rejected(status)),
            },
            _ if reply.command() == u8::from(command) => Ok(reply),
            _ => Err(Error::UnexpectedResponse {
                expected: command.into(),
                found: reply.command(),
            }),
        }
    }

    /// A single write. Anything less than the whole frame is reported to the caller as is.
    fn write_frame(&mut self, bytes: &[u8]) -> Result<usize, S::Error> {
        let written = self.interface.write(bytes).map_err(Error::Serial)?;
        self.interface.flush().map_err(Error::Serial)?;
        Ok(written)
    }

    /// Read until `buffer` is full or the link times out, returning the byte count.
    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<usize, S::Error> {
        let mut received = 0;
        while received < buffer.len() {
            match self.interface.read(&mut buffer[received..]) {
                Ok(0) => break,
                Ok(bytes_read) => received += bytes_read,
                // A timeout ends the frame; whatever arrived is checked by the caller.
                Err(e) if embedded_io::Error::kind(&e) == embedded_io::ErrorKind::TimedOut => {
                    break;
                }
                Err(e) => return Err(Error::Serial(e)),
            }
        }
        Ok(received)
    }

    #[cfg(test)]
    pub(crate) fn interface(&self) -> &S {
        &self.interface
    }

    #[cfg(test)]
    pub(crate) fn interface_mut(&mut self) -> &mut S {
        &mut self.interface
    }
}

impl<S> Drop for LoadController<S>
where
    S: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
{
    fn drop(&mut self) {
        if self.closed || !self.remote {
            return;
        }
        if let Err(e) = self.set_local() {
            warn!(error = %e, "could not return load to local control");
        }
    }
}
