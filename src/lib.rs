//! This crate drives a fuel-cell / electrolyzer characterisation rig made of an IT85xx-style
//! programmable electronic load and a SCPI-speaking programmable power supply.
//!
//! It provides:
//! * [frame]: the load's fixed 26-byte frames with their additive checksum.
//! * [transport]: serial links with per-transfer deadlines.
//! * [load::LoadController] and [supply::SupplyController]: the command sets of both instruments.
//! * [sweep::SweepController]: timed linear ramps running on their own thread.
//! * [rig::Rig]: operating mode switching, live polling and sweep launch on top of both
//!   instruments.
//! * [sink]: CSV, channel and in-memory row sinks.
//!
//! The drivers are generic over [embedded_io::Read] + [embedded_io::ReadReady] +
//! [embedded_io::Write], so they can run on anything that moves bytes. `ReadReady` lets them drop
//! late replies before sending a new request.
//!
//! The serial ports should be configured like so:
//! * Electronic load: 38400 baud, 8 data bits, no parity, 1 stop bit
//! * Power supply: 9600 baud, 8 data bits, no parity, 1 stop bit, `\n` terminated lines

pub mod config;
pub mod error;
pub mod frame;
pub mod load;
pub mod logging;
pub mod rig;
pub mod sink;
pub mod supply;
pub mod sweep;
pub mod transport;
pub mod types;

#[cfg(test)]
mod mock_serial;
