//! Driver for the programmable power supply.
//!
//! The supply speaks newline-terminated ASCII commands. Set-commands get no reply; the two
//! measurement queries are answered with a single line holding a floating point literal.

use core::fmt::Write as _;

use tracing::{trace, warn};

use crate::{
    error::{Error, Result},
    transport,
    types::State,
};

/// Line terminator for both directions.
pub const TERMINATOR: u8 = b'\n';

const OUTPUT_ON: &str = "OUTP:TRIG 1\n";
const OUTPUT_OFF: &str = "OUTP:TRIG 0\n";
const ARM_OUTPUT: &str = "INIT:NAME OUTP\n";
const QUERY_VOLTAGE: &str = "meas:volt:dc?\n";
const QUERY_CURRENT: &str = "meas:curr:dc?\n";

/// You can create a SupplyController using any interface which implements [embedded_io::Read],
/// [embedded_io::ReadReady] & [embedded_io::Write].
///
/// `L` bounds the length of a response line.
pub struct SupplyController<
    S: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
    const L: usize = 256,
> {
    interface: S,
}

impl<S, const L: usize> SupplyController<S, L>
where
    S: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
{
    pub fn new(interface: S) -> Self {
        Self { interface }
    }

    /// Enable/disable the output.
    ///
    /// The trigger state is written first, then the output is armed so it takes effect.
    pub fn set_output_enabled(&mut self, state: impl Into<State>) -> Result<(), S::Error> {
        let trigger = match state.into() {
            State::On => OUTPUT_ON,
            State::Off => OUTPUT_OFF,
        };
        self.send(trigger)?;
        self.send(ARM_OUTPUT)
    }

    /// Set the output voltage, sent with three decimal places.
    pub fn set_voltage(&mut self, volts: f32) -> Result<(), S::Error> {
        if !volts.is_finite() || volts < 0.0 {
            return Err(Error::InvalidRange);
        }
        let mut command: heapless::String<48> = heapless::String::new();
        writeln!(command, "SOUR:VOLT:LEV:IMM:AMPL {volts:.3}").map_err(|_| Error::InvalidRange)?;
        self.send(&command)
    }

    /// Return the measured output voltage in volts.
    pub fn read_voltage(&mut self) -> Result<f32, S::Error> {
        self.query(QUERY_VOLTAGE)
    }

    /// Return the measured output current in amps.
    pub fn read_current(&mut self) -> Result<f32, S::Error> {
        self.query(QUERY_CURRENT)
    }

    fn send(&mut self, command: &str) -> Result<(), S::Error> {
        trace!(command = command.trim_end(), "supply command");
        let expected = command.len();
        let written = self
            .interface
            .write(command.as_bytes())
            .map_err(Error::Serial)?;
        self.interface.flush().map_err(Error::Serial)?;
        if written != expected {
            return Err(Error::ShortWrite { written, expected });
        }
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<f32, S::Error> {
        // A reply that missed an earlier deadline must not answer this query.
        let stale = transport::discard_input(&mut self.interface).map_err(Error::Serial)?;
        if stale > 0 {
            warn!(bytes = stale, "discarded late supply reply");
        }
        self.send(command)?;
        let line = self.read_line()?;
        let text = core::str::from_utf8(&line).map_err(|_| Error::InvalidResponse)?;
        trace!(response = text.trim_end(), "supply response");
        text.trim().parse::<f32>().map_err(|_| Error::InvalidResponse)
    }

    /// Read up to and excluding the terminator.
    fn read_line(&mut self) -> Result<heapless::Vec<u8, L>, S::Error> {
        let mut line: heapless::Vec<u8, L> = heapless::Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.interface.read(&mut byte) {
                Ok(0) => return Err(Error::Timeout),
                Ok(_) if byte[0] == TERMINATOR => return Ok(line),
                Ok(_) => line.push(byte[0]).map_err(|_| Error::InvalidResponse)?,
                Err(e) if embedded_io::Error::kind(&e) == embedded_io::ErrorKind::TimedOut => {
                    return Err(Error::Timeout);
                }
                Err(e) => return Err(Error::Serial(e)),
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{MockSerial, MockSerialError, emulate_supply};
    use approx::assert_relative_eq;

    #[test]
    fn output_enable_sends_trigger_then_arm() {
        let mut supply: SupplyController<MockSerial> = SupplyController::new(MockSerial::new());
        supply.set_output_enabled(true).unwrap();
        supply.set_output_enabled(State::Off).unwrap();

        let requests = supply.interface().requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0], b"OUTP:TRIG 1\n");
        assert_eq!(requests[1], b"INIT:NAME OUTP\n");
        assert_eq!(requests[2], b"OUTP:TRIG 0\n");
        assert_eq!(requests[3], b"INIT:NAME OUTP\n");
    }

    #[test]
    fn short_trigger_write_stops_before_arming() {
        let mut mock = MockSerial::new();
        mock.set_write_limit(Some(5));
        let mut supply: SupplyController<MockSerial> = SupplyController::new(mock);

        assert!(matches!(
            supply.set_output_enabled(true),
            Err(Error::ShortWrite {
                written: 5,
                expected: 12
            })
        ));
        assert_eq!(supply.interface().requests().len(), 1);
    }

    #[test]
    fn set_voltage_uses_three_decimals() {
        let mut supply: SupplyController<MockSerial> = SupplyController::new(MockSerial::new());
        supply.set_voltage(12.3456).unwrap();
        supply.set_voltage(1.5).unwrap();

        let requests = supply.interface().requests();
        assert_eq!(requests[0], b"SOUR:VOLT:LEV:IMM:AMPL 12.346\n");
        assert_eq!(requests[1], b"SOUR:VOLT:LEV:IMM:AMPL 1.500\n");

        assert!(matches!(supply.set_voltage(-1.0), Err(Error::InvalidRange)));
        assert!(matches!(supply.set_voltage(f32::INFINITY), Err(Error::InvalidRange)));
    }

    #[test]
    fn queries_parse_scpi_numbers() {
        let mut supply: SupplyController<MockSerial> = SupplyController::new(
            MockSerial::with_responder(emulate_supply("+1.20000E+01", " 2.5\r")),
        );
        assert_relative_eq!(supply.read_voltage().unwrap(), 12.0);
        assert_relative_eq!(supply.read_current().unwrap(), 2.5);

        let requests = supply.interface().requests();
        assert_eq!(requests[0], b"meas:volt:dc?\n");
        assert_eq!(requests[1], b"meas:curr:dc?\n");
    }

    #[test]
    fn measured_zero_is_distinct_from_failure() {
        let mut supply: SupplyController<MockSerial> =
            SupplyController::new(MockSerial::with_responder(emulate_supply("0.000", "0")));
        assert_eq!(supply.read_current().unwrap(), 0.0);

        let mut silent: SupplyController<MockSerial> = SupplyController::new(MockSerial::new());
        assert!(matches!(silent.read_current(), Err(Error::Timeout)));
    }

    #[test]
    fn unterminated_or_garbled_replies_fail() {
        let mut supply: SupplyController<MockSerial> = SupplyController::new(MockSerial::new());
        supply.interface_mut().queue_reply(b"1.234");
        assert!(matches!(supply.read_voltage(), Err(Error::Timeout)));

        supply.interface_mut().queue_reply(b"volts\n");
        assert!(matches!(supply.read_voltage(), Err(Error::InvalidResponse)));

        let mut tight: SupplyController<MockSerial, 4> = SupplyController::new(MockSerial::new());
        tight.interface_mut().queue_reply(b"12.34567\n");
        assert!(matches!(tight.read_voltage(), Err(Error::InvalidResponse)));
    }

    #[test]
    fn read_errors_propagate() {
        // Reported with kind `Other`, which must not be mistaken for a timeout.
        let mut mock = MockSerial::new();
        mock.set_read_error(true);
        let mut supply: SupplyController<MockSerial> = SupplyController::new(mock);
        assert!(matches!(
            supply.read_current(),
            Err(Error::Serial(MockSerialError::SimulatedError))
        ));
    }

    #[test]
    fn late_reply_does_not_answer_the_next_query() {
        let mut supply: SupplyController<MockSerial> =
            SupplyController::new(MockSerial::with_responder(emulate_supply("1.8", "4.0")));
        supply.interface_mut().queue_read_data(b"9.9\n");

        assert_relative_eq!(supply.read_voltage().unwrap(), 1.8);
        assert_relative_eq!(supply.read_current().unwrap(), 4.0);
    }
}
