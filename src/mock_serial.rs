//! We use this mocking module in unit tests to emulate the serial links to both instruments.

use std::collections::VecDeque;

use crate::frame::{self, CommandCode, FRAME_LEN};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Our mock type used to emulate a serial port.
pub struct MockSerial {
    /// Every byte written to the mock serial port.
    write_buffer: Vec<u8>,
    /// Each individual `write` call, in order.
    requests: Vec<Vec<u8>>,
    /// Response bytes waiting to be read.
    read_buffer: VecDeque<u8>,
    /// Scripted answers, one per write, taking precedence over `responder`.
    replies: VecDeque<Vec<u8>>,
    /// Produces a response for every write, like an instrument would.
    responder: Option<Responder>,
    /// Accept at most this many bytes per write, to simulate short writes.
    write_limit: Option<usize>,
    /// Count of times unread bytes were found when a new request started.
    overlapping_requests: usize,
    /// Flag to simulate write errors
    should_error_on_write: bool,
    /// Flag to simulate read errors
    should_error_on_read: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MockSerialError {
    /// Generic simulated error for testing
    #[error("Simulated link failure")]
    SimulatedError,
    /// Would block - no data available
    #[error("No data available")]
    WouldBlock,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
            MockSerialError::WouldBlock => embedded_io::ErrorKind::TimedOut,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }

        let accepted = match self.write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        let chunk = &buf[..accepted];
        if !self.read_buffer.is_empty() {
            self.overlapping_requests += 1;
        }
        self.write_buffer.extend_from_slice(chunk);
        self.requests.push(chunk.to_vec());

        if let Some(reply) = self.replies.pop_front() {
            self.read_buffer.extend(reply);
        } else if let Some(responder) = self.responder.as_mut() {
            if let Some(response) = responder(chunk) {
                self.read_buffer.extend(response);
            }
        }

        Ok(accepted)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }

        if self.read_buffer.is_empty() {
            return Err(MockSerialError::WouldBlock);
        }

        let bytes_to_read = buf.len().min(self.read_buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.read_buffer.drain(..bytes_to_read)) {
            *slot = byte;
        }
        Ok(bytes_to_read)
    }
}

impl embedded_io::ReadReady for MockSerial {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let ready = !self.read_buffer.is_empty();
        if ready {
            self.overlapping_requests += 1;
        }
        Ok(ready)
    }
}

impl MockSerial {
    /// Create a new MockSerial instance with empty buffers
    pub fn new() -> Self {
        Self {
            write_buffer: Vec::new(),
            requests: Vec::new(),
            read_buffer: VecDeque::new(),
            replies: VecDeque::new(),
            responder: None,
            write_limit: None,
            overlapping_requests: 0,
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    /// Create a mock which answers every write through `responder`.
    pub fn with_responder(
        responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) -> Self {
        let mut mock = Self::new();
        mock.responder = Some(Box::new(responder));
        mock
    }

    /// Answer the next write that has no earlier scripted reply with `data`.
    pub fn queue_reply(&mut self, data: &[u8]) {
        self.replies.push_back(data.to_vec());
    }

    /// Append `data` to the bytes waiting to be read, as if it arrived unsolicited.
    pub fn queue_read_data(&mut self, data: &[u8]) {
        self.read_buffer.extend(data.iter().copied());
    }

    /// Get a reference to the data that was written to this mock serial port
    pub fn written_data(&self) -> &[u8] {
        &self.write_buffer
    }

    /// The individual writes, in order.
    pub fn requests(&self) -> &[Vec<u8>] {
        &self.requests
    }

    /// Clear the write history.
    pub fn clear_written_data(&mut self) {
        self.write_buffer.clear();
        self.requests.clear();
    }

    pub fn overlapping_requests(&self) -> usize {
        self.overlapping_requests
    }

    /// Simulate a link that only accepts `limit` bytes per write.
    pub fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

/// Build a frame the way the load would send it.
pub fn load_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = [0u8; FRAME_LEN];
    bytes[0] = frame::SYNC;
    bytes[2] = command;
    bytes[3..3 + payload.len()].copy_from_slice(payload);
    bytes[frame::CHECKSUM_INDEX] = frame::checksum(&bytes);
    bytes.to_vec()
}

/// The load's "command successful" status frame.
pub fn load_ok() -> Vec<u8> {
    load_frame(CommandCode::Status as u8, &[0x80])
}

/// A VCP query response carrying the given raw field values.
pub fn load_vcp(voltage_mv: u32, current_raw: u32, power_mw: u32) -> Vec<u8> {
    let mut payload = [0u8; 12];
    payload[0..4].copy_from_slice(&voltage_mv.to_le_bytes());
    payload[4..8].copy_from_slice(&current_raw.to_le_bytes());
    payload[8..12].copy_from_slice(&power_mw.to_le_bytes());
    load_frame(CommandCode::QueryVcp as u8, &payload)
}

/// Emulates the electronic load: acknowledges set-commands and answers VCP queries.
pub fn emulate_load(
    voltage_mv: u32,
    current_raw: u32,
    power_mw: u32,
) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
    move |request: &[u8]| {
        let parsed = frame::decode(request).ok()?;
        match parsed.command_code()? {
            CommandCode::QueryVcp => Some(load_vcp(voltage_mv, current_raw, power_mw)),
            _ => Some(load_ok()),
        }
    }
}

/// Emulates the power supply: answers the two measurement queries, stays silent otherwise.
pub fn emulate_supply(
    voltage: &'static str,
    current: &'static str,
) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
    move |request: &[u8]| match request {
        b"meas:volt:dc?\n" => Some(format!("{voltage}\n").into_bytes()),
        b"meas:curr:dc?\n" => Some(format!("{current}\n").into_bytes()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, ReadReady, Write};

    #[test]
    fn test_write_data() {
        let mut mock = MockSerial::new();
        let test_data = b"Hello, World!";

        let result = mock.write(test_data);
        assert_eq!(result.unwrap(), test_data.len());
        assert_eq!(mock.written_data(), test_data);
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_read_partial_then_exhausted() {
        let mut mock = MockSerial::new();
        mock.queue_read_data(b"Long response data");

        let mut buffer = [0u8; 5];
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"Long ");

        let mut rest = [0u8; 32];
        assert_eq!(mock.read(&mut rest).unwrap(), 13);
        assert!(matches!(
            mock.read(&mut rest).unwrap_err(),
            MockSerialError::WouldBlock
        ));
    }

    #[test]
    fn test_write_limit_simulates_short_write() {
        let mut mock = MockSerial::new();
        mock.set_write_limit(Some(10));
        assert_eq!(mock.write(&[0u8; 26]).unwrap(), 10);
        assert_eq!(mock.written_data().len(), 10);
    }

    #[test]
    fn test_error_flags_toggle() {
        let mut mock = MockSerial::new();

        mock.set_write_error(true);
        assert!(mock.write(b"test").is_err());
        assert!(mock.flush().is_err());
        mock.set_write_error(false);
        assert!(mock.write(b"test").is_ok());

        mock.queue_read_data(b"data");
        mock.set_read_error(true);
        let mut buffer = [0u8; 10];
        assert!(mock.read(&mut buffer).is_err());
        mock.set_read_error(false);
        assert!(mock.read(&mut buffer).is_ok());
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(
            MockSerialError::WouldBlock.kind(),
            embedded_io::ErrorKind::TimedOut
        ));
        assert!(matches!(
            MockSerialError::SimulatedError.kind(),
            embedded_io::ErrorKind::Other
        ));
    }

    #[test]
    fn test_load_emulator_answers_frames() {
        let mut mock = MockSerial::with_responder(emulate_load(5000, 12345, 61725));
        let query = frame::encode(CommandCode::QueryVcp, &[]).unwrap();
        mock.write(&query).unwrap();

        let mut response = [0u8; FRAME_LEN];
        assert_eq!(mock.read(&mut response).unwrap(), FRAME_LEN);
        let parsed = frame::decode(&response).unwrap();
        assert_eq!(parsed.field_u32(3), Some(5000));

        // Garbage gets no answer.
        mock.write(b"garbage").unwrap();
        assert!(mock.read(&mut response).is_err());
    }

    #[test]
    fn test_scripted_replies_answer_writes_in_order() {
        let mut mock = MockSerial::with_responder(|_: &[u8]| Some(b"responder".to_vec()));
        mock.queue_reply(b"first");
        mock.queue_reply(b"second");

        let mut buffer = [0u8; 16];
        mock.write(b"a").unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        mock.write(b"b").unwrap();
        let n = mock.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"second");
        mock.write(b"c").unwrap();
        let n = mock.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"responder");
    }

    #[test]
    fn test_unsolicited_data_is_ready_before_any_write() {
        let mut mock = MockSerial::new();
        assert!(!mock.read_ready().unwrap());
        mock.queue_read_data(b"late");
        assert!(mock.read_ready().unwrap());
        assert_eq!(mock.overlapping_requests(), 1);
    }

    #[test]
    fn test_overlapping_requests_are_counted() {
        let mut mock = MockSerial::with_responder(emulate_load(0, 0, 0));
        let query = frame::encode(CommandCode::QueryVcp, &[]).unwrap();
        mock.write(&query).unwrap();
        mock.write(&query).unwrap();
        assert_eq!(mock.overlapping_requests(), 1);
    }
}
