//! Error types shared by the instrument drivers.

use thiserror::Error;

use crate::{frame::FrameError, load::ResponseStatus};

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Communication error returned by every load and supply operation.
///
/// When an operation fails the commanded value must be assumed not to have taken effect.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Serial communication error: {0:?}")]
    Serial(I),
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("Short read: {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },
    #[error("Communication timeout")]
    Timeout,
    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Command rejected by instrument: {0:?}")]
    Rejected(ResponseStatus),
    #[error("Expected response to command {expected:#04x}, got {found:#04x}")]
    UnexpectedResponse { expected: u8, found: u8 },
    #[error("Invalid response received")]
    InvalidResponse,
    #[error("Invalid range")]
    InvalidRange,
}

impl<I: embedded_io::Error> Error<I> {
    /// True for failures of the link itself (as opposed to a bad or refused reply).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Serial(_) | Error::ShortWrite { .. } | Error::ShortRead { .. } | Error::Timeout
        )
    }

    /// True when a reply arrived but failed integrity checks.
    pub fn is_checksum(&self) -> bool {
        matches!(self, Error::Frame(_))
    }
}
