//! Rig configuration, read from a TOML file.
//!
//! Every field has a default, so a missing file or a partial one both work:
//!
//! ```toml
//! sampling_hz = 10.0
//! output_dir = "outputs"
//!
//! [load]
//! port = "COM6"
//!
//! [supply]
//! port = "COM3"
//!
//! [sweep]
//! mode = "electrolysis"
//! target = 2.0
//! baseline = 1.4
//! steps = 20
//! dwell_ms = 1000
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use fugit::MillisDurationU32;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    logging::LogConfig,
    rig::OperatingMode,
    sweep::{SweepSpec, SweepSpecBuilder, SweepSpecError},
    transport::LinkSettings,
    types::HydrogenRate,
};

/// Allowed interactive polling rates.
pub const SAMPLING_HZ_RANGE: core::ops::RangeInclusive<f32> = 1.0..=60.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    #[serde(default = "PortConfig::default_load")]
    pub load: PortConfig,
    #[serde(default = "PortConfig::default_supply")]
    pub supply: PortConfig,
    /// Interactive polling rate.
    #[serde(default = "RigConfig::default_sampling_hz")]
    pub sampling_hz: f32,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub hydrogen: HydrogenRate,
    /// Where CSV logs are written.
    #[serde(default = "RigConfig::default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub port: String,
    /// Overrides the instrument's standard rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub mode: OperatingMode,
    /// Final load current (A) or supply voltage (V).
    #[serde(default)]
    pub target: f32,
    /// Start voltage of an electrolysis ramp, typically the open-circuit voltage.
    #[serde(default)]
    pub baseline: f32,
    #[serde(default = "SweepConfig::default_steps")]
    pub steps: u32,
    #[serde(default = "SweepConfig::default_dwell_ms")]
    pub dwell_ms: u32,
}

impl PortConfig {
    fn default_load() -> Self {
        Self {
            port: if cfg!(windows) { "COM6" } else { "/dev/ttyUSB0" }.to_string(),
            baud_rate: None,
        }
    }

    fn default_supply() -> Self {
        Self {
            port: if cfg!(windows) { "COM3" } else { "/dev/ttyUSB1" }.to_string(),
            baud_rate: None,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            target: 0.0,
            baseline: 0.0,
            steps: Self::default_steps(),
            dwell_ms: Self::default_dwell_ms(),
        }
    }
}

impl SweepConfig {
    fn default_steps() -> u32 {
        20
    }
    fn default_dwell_ms() -> u32 {
        1000
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            load: PortConfig::default_load(),
            supply: PortConfig::default_supply(),
            sampling_hz: Self::default_sampling_hz(),
            sweep: SweepConfig::default(),
            hydrogen: HydrogenRate::default(),
            output_dir: Self::default_output_dir(),
            log: LogConfig::default(),
        }
    }
}

impl RigConfig {
    fn default_sampling_hz() -> f32 {
        10.0
    }
    fn default_output_dir() -> PathBuf {
        PathBuf::from("outputs")
    }

    /// Read `path`, or return the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn parse(txt: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(txt)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SAMPLING_HZ_RANGE.contains(&self.sampling_hz) {
            return Err(ConfigError::Invalid(format!(
                "sampling_hz must be within {:?}, got {}",
                SAMPLING_HZ_RANGE, self.sampling_hz
            )));
        }
        for (name, port) in [("load", &self.load), ("supply", &self.supply)] {
            if port.port.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.port is empty")));
            }
            if port.baud_rate == Some(0) {
                return Err(ConfigError::Invalid(format!("{name}.baud_rate is zero")));
            }
        }
        if self.hydrogen.cells == 0 {
            return Err(ConfigError::Invalid("hydrogen.cells is zero".into()));
        }
        self.sweep_spec()
            .map(|_| ())
            .map_err(|e| ConfigError::Invalid(format!("sweep: {e}")))
    }

    pub fn load_link(&self) -> LinkSettings {
        let standard = LinkSettings::load();
        LinkSettings {
            baud_rate: self.load.baud_rate.unwrap_or(standard.baud_rate),
            ..standard
        }
    }

    pub fn supply_link(&self) -> LinkSettings {
        let standard = LinkSettings::supply();
        LinkSettings {
            baud_rate: self.supply.baud_rate.unwrap_or(standard.baud_rate),
            ..standard
        }
    }

    /// Polling period for the interactive loop.
    pub fn sampling_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f32(1.0 / self.sampling_hz)
    }

    /// The sweep described by the `[sweep]` and `[hydrogen]` sections.
    pub fn sweep_spec(&self) -> Result<SweepSpec, SweepSpecError> {
        SweepSpecBuilder::new(self.sweep.mode.sweep_mode(), self.sweep.target)
            .with_baseline(self.sweep.baseline)
            .with_steps(self.sweep.steps)
            .with_dwell(MillisDurationU32::millis(self.sweep.dwell_ms))
            .with_hydrogen(self.hydrogen)
            .build()
    }
}
