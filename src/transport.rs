//! Serial link to an instrument.
//!
//! [SerialTransport] wraps a [serialport] port and exposes it through [embedded_io], so the
//! load and supply drivers can run on it unchanged. Reads and writes follow a total-timeout
//! model: each call gets a deadline of a constant plus a per-byte allowance, and a read that
//! has started receiving ends early once the line goes quiet for longer than the interval
//! timeout.

use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;
use tracing::{debug, trace};

/// Deadlines applied to every read and write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum quiet gap between two bytes once a read has started receiving.
    pub read_interval: Option<Duration>,
    pub read_total_constant: Duration,
    pub read_total_per_byte: Duration,
    pub write_total_constant: Duration,
    pub write_total_per_byte: Duration,
}

impl Timeouts {
    /// Deadline for a read of `len` bytes.
    pub fn read_deadline(&self, len: usize) -> Duration {
        self.read_total_constant + self.read_total_per_byte.saturating_mul(len as u32)
    }

    /// Deadline for a write of `len` bytes.
    pub fn write_deadline(&self, len: usize) -> Duration {
        self.write_total_constant + self.write_total_per_byte.saturating_mul(len as u32)
    }
}

/// Line parameters and timeouts for one instrument link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    pub timeouts: Timeouts,
}

impl LinkSettings {
    /// 8N1 without flow control at the given rate.
    pub fn new(baud_rate: u32, timeouts: Timeouts) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeouts,
        }
    }

    /// The electronic load: 38400 baud 8N1.
    pub fn load() -> Self {
        Self::new(
            38_400,
            Timeouts {
                read_interval: Some(Duration::from_millis(1000)),
                read_total_constant: Duration::from_millis(5000),
                read_total_per_byte: Duration::from_millis(500),
                write_total_constant: Duration::from_millis(2000),
                write_total_per_byte: Duration::from_millis(500),
            },
        )
    }

    /// The power supply: 9600 baud 8N1, 5 s per transfer.
    pub fn supply() -> Self {
        Self::new(
            9_600,
            Timeouts {
                read_interval: None,
                read_total_constant: Duration::from_millis(5000),
                read_total_per_byte: Duration::ZERO,
                write_total_constant: Duration::from_millis(5000),
                write_total_per_byte: Duration::ZERO,
            },
        )
    }
}

/// Failure to bring up a serial link.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Failed to open serial port {port}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("Failed to configure serial port {port}")]
    Configure {
        port: String,
        #[source]
        source: serialport::Error,
    },
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>, serialport::Error> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|port| port.port_name)
        .collect())
}

/// An open serial link.
pub struct SerialTransport {
    name: String,
    port: Box<dyn SerialPort>,
    timeouts: Timeouts,
}

impl SerialTransport {
    /// Open `name` with `settings` and discard anything already buffered on the line.
    pub fn open(name: &str, settings: &LinkSettings) -> Result<Self, OpenError> {
        let port = serialport::new(name, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(settings.flow_control)
            .timeout(settings.timeouts.read_total_constant)
            .open()
            .map_err(|source| OpenError::Open {
                port: name.to_owned(),
                source,
            })?;
        port.clear(ClearBuffer::All)
            .map_err(|source| OpenError::Configure {
                port: name.to_owned(),
                source,
            })?;
        debug!(port = name, baud = settings.baud_rate, "serial link open");

        Ok(Self {
            name: name.to_owned(),
            port,
            timeouts: settings.timeouts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    fn set_wait(&mut self, wait: Duration) -> Result<(), IoError> {
        self.port
            .set_timeout(wait)
            .map_err(|e| IoError(std::io::Error::from(e)))
    }
}

impl core::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// [std::io::Error] carried through [embedded_io].
#[derive(Debug)]
pub struct IoError(pub std::io::Error);

impl IoError {
    fn timed_out() -> Self {
        Self(std::io::Error::from(std::io::ErrorKind::TimedOut))
    }
}

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialTransport {
    type Error = IoError;
}

impl embedded_io::Read for SerialTransport {
    /// Fill as much of `buf` as arrives before the deadline.
    ///
    /// Fails with [std::io::ErrorKind::TimedOut] if nothing arrived at all.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.timeouts.read_deadline(buf.len());
        let mut filled = 0;

        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let mut wait = deadline - now;
            if filled > 0 {
                if let Some(interval) = self.timeouts.read_interval {
                    wait = wait.min(interval);
                }
            }
            self.set_wait(wait)?;

            match std::io::Read::read(&mut self.port, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IoError(e)),
            }
        }

        trace!(port = %self.name, requested = buf.len(), received = filled, "serial read");
        if filled == 0 {
            return Err(IoError::timed_out());
        }
        Ok(filled)
    }
}

impl embedded_io::Write for SerialTransport {
    /// Write as much of `buf` as the line accepts before the deadline.
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.timeouts.write_deadline(buf.len());
        let mut written = 0;

        while written < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.set_wait(deadline - now)?;

            match std::io::Write::write(&mut self.port, &buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IoError(e)),
            }
        }

        trace!(port = %self.name, requested = buf.len(), written, "serial write");
        if written == 0 {
            return Err(IoError::timed_out());
        }
        Ok(written)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.port).map_err(IoError)
    }
}

impl embedded_io::ReadReady for SerialTransport {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let pending = self
            .port
            .bytes_to_read()
            .map_err(|e| IoError(e.into()))?;
        Ok(pending > 0)
    }
}

/// Read and drop whatever is already waiting on `link`, returning the byte count.
///
/// Bytes are taken one at a time so a partial leftover never waits out a read deadline.
pub fn discard_input<S>(link: &mut S) -> Result<usize, S::Error>
where
    S: embedded_io::Read + embedded_io::ReadReady,
{
    let mut scratch = [0u8; 1];
    let mut discarded = 0;
    while link.read_ready()? {
        match link.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if embedded_io::Error::kind(&e) == embedded_io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(discarded)
}
