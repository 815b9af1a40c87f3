//! Destinations for measurement rows.
//!
//! Live telemetry and sweep samples share one row layout:
//! `time,voltage,current,power,hydrogen,mode,setpoint`. A failed measurement leaves its fields
//! empty instead of writing zeros. The setpoint is empty for live rows and for sweep steps whose
//! setpoint command failed.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};

use chrono::{DateTime, Local};
use thiserror::Error;

use crate::types::Measurement;

/// Column names, in order.
pub const HEADER: [&str; 7] = [
    "time", "voltage", "current", "power", "hydrogen", "mode", "setpoint",
];

/// File name prefix for live monitoring logs.
pub const LIVE_PREFIX: &str = "data";
/// File name prefix for fuel-cell (generation) sweeps.
pub const GENERATION_SWEEP_PREFIX: &str = "ivp-fc-";
/// File name prefix for electrolyzer sweeps.
pub const ELECTROLYSIS_SWEEP_PREFIX: &str = "ivp-ec-";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Row receiver disconnected")]
    Disconnected,
}

/// One output row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Row {
    /// Time since the start of the run.
    pub elapsed: Duration,
    /// `None` when the instruments could not be read.
    pub measurement: Option<Measurement>,
    /// Hydrogen rate in NL/h.
    pub derived_rate: Option<f32>,
    /// 0 for generation, 1 for electrolysis.
    pub mode: u8,
    /// The sweep setpoint the instrument accepted for this step.
    pub setpoint: Option<f32>,
}

impl Row {
    /// Render the row as text fields in column order.
    pub fn fields(&self) -> [String; 7] {
        let (voltage, current, power) = match self.measurement {
            Some(m) => (
                format!("{:.2}", m.voltage),
                format!("{:.3}", m.current),
                format!("{:.3}", m.power),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        [
            format!("{:.4}", self.elapsed.as_secs_f64()),
            voltage,
            current,
            power,
            self.derived_rate
                .map(|rate| format!("{rate:.3}"))
                .unwrap_or_default(),
            self.mode.to_string(),
            self.setpoint
                .map(|setpoint| format!("{setpoint:.4}"))
                .unwrap_or_default(),
        ]
    }
}

/// Anything that accepts rows. Implementations must be movable onto the sweep thread.
pub trait Sink: Send {
    fn append_row(&mut self, row: &Row) -> Result<(), SinkError>;
}

impl<T: Sink + ?Sized> Sink for Box<T> {
    fn append_row(&mut self, row: &Row) -> Result<(), SinkError> {
        (**self).append_row(row)
    }
}

/// Writes rows as CSV, flushing after each one so a crash loses at most the last row.
pub struct CsvSink<W: io::Write> {
    writer: csv::Writer<W>,
}

impl<W: io::Write> CsvSink<W> {
    /// Wrap `inner` and write the header line.
    pub fn new(inner: W) -> Result<Self, SinkError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        writer.write_record(HEADER)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(e.into_error()))
    }
}

impl CsvSink<File> {
    /// Create `<dir>/<prefix><timestamp>.csv`, creating `dir` if needed.
    pub fn create_in(dir: &Path, prefix: &str) -> Result<(PathBuf, Self), SinkError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(output_file_name(prefix, Local::now()));
        let sink = Self::new(File::create(&path)?)?;
        Ok((path, sink))
    }
}

impl<W: io::Write + Send> Sink for CsvSink<W> {
    fn append_row(&mut self, row: &Row) -> Result<(), SinkError> {
        self.writer.write_record(row.fields())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// `<prefix>Y-M-D-h-m-s.csv` without zero padding, e.g. `data2024-5-3-9-7-2.csv`.
pub fn output_file_name(prefix: &str, at: DateTime<Local>) -> String {
    format!("{prefix}{}.csv", at.format("%Y-%-m-%-d-%-H-%-M-%-S"))
}

/// Forwards rows over a channel, e.g. to a display thread.
pub struct ChannelSink {
    sender: mpsc::Sender<Row>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Row>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::Receiver<Row>) {
        let (sender, receiver) = mpsc::channel();
        (Self::new(sender), receiver)
    }
}

impl Sink for ChannelSink {
    fn append_row(&mut self, row: &Row) -> Result<(), SinkError> {
        self.sender.send(*row).map_err(|_| SinkError::Disconnected)
    }
}

/// Keeps every row in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Vec<Row>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl Sink for MemorySink {
    fn append_row(&mut self, row: &Row) -> Result<(), SinkError> {
        self.rows.push(*row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_row() -> Row {
        Row {
            elapsed: Duration::from_millis(1500),
            measurement: Some(Measurement::new(12.3456, 1.23456, 15.2416)),
            derived_rate: Some(0.54812),
            mode: 0,
            setpoint: Some(1.25),
        }
    }

    #[test]
    fn fields_use_fixed_precision() {
        assert_eq!(
            sample_row().fields(),
            ["1.5000", "12.35", "1.235", "15.242", "0.548", "0", "1.2500"]
        );
    }

    #[test]
    fn failed_measurement_leaves_fields_empty() {
        let row = Row {
            measurement: None,
            derived_rate: None,
            mode: 1,
            setpoint: None,
            ..sample_row()
        };
        assert_eq!(row.fields(), ["1.5000", "", "", "", "", "1", ""]);
    }

    #[test]
    fn csv_sink_writes_header_then_rows() {
        let mut sink = CsvSink::new(Vec::new()).unwrap();
        sink.append_row(&sample_row()).unwrap();
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(
            text,
            "time,voltage,current,power,hydrogen,mode,setpoint\n1.5000,12.35,1.235,15.242,0.548,0,1.2500\n"
        );
    }

    #[test]
    fn csv_file_is_created_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("outputs");
        let (path, mut sink) = CsvSink::create_in(&out, GENERATION_SWEEP_PREFIX).unwrap();
        sink.append_row(&sample_row()).unwrap();
        drop(sink);

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ivp-fc-") && name.ends_with(".csv"));
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn file_names_are_not_zero_padded() {
        let at = Local.with_ymd_and_hms(2024, 5, 3, 9, 7, 2).unwrap();
        assert_eq!(output_file_name(LIVE_PREFIX, at), "data2024-5-3-9-7-2.csv");
        assert_eq!(
            output_file_name(ELECTROLYSIS_SWEEP_PREFIX, at),
            "ivp-ec-2024-5-3-9-7-2.csv"
        );
    }

    #[test]
    fn channel_sink_reports_hang_up() {
        let (mut sink, receiver) = ChannelSink::channel();
        sink.append_row(&sample_row()).unwrap();
        assert_eq!(receiver.recv().unwrap(), sample_row());

        drop(receiver);
        assert!(matches!(
            sink.append_row(&sample_row()),
            Err(SinkError::Disconnected)
        ));
    }
}
