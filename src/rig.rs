//! The test rig: electronic load, power supply and the sweep engine driving them.
//!
//! In [OperatingMode::Generation] the fuel cell feeds the electronic load; in
//! [OperatingMode::Electrolysis] the supply powers the electrolyzer while the load only measures.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    error::Error,
    load::LoadController,
    sink::{ELECTROLYSIS_SWEEP_PREFIX, GENERATION_SWEEP_PREFIX, Row, Sink},
    supply::SupplyController,
    sweep::{SweepController, SweepError, SweepHandle, SweepMode, SweepSpec, SweepSpecError},
    types::{HydrogenRate, Measurement, State},
};

/// Another thread panicked while holding the named instrument.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{0} lock poisoned")]
pub struct Poisoned(pub &'static str);

/// An instrument shared between the interactive path and a running sweep.
///
/// Every command/response exchange happens under the lock, so frames from two threads never
/// interleave on the wire.
pub struct Shared<T> {
    name: &'static str,
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<T> Shared<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>, Poisoned> {
        self.inner.lock().map_err(|_| Poisoned(self.name))
    }
}

#[derive(Error, Debug)]
pub enum RigError<A: embedded_io::Error, B: embedded_io::Error> {
    #[error("Electronic load: {0}")]
    Load(Error<A>),
    #[error("Power supply: {0}")]
    Supply(Error<B>),
    #[error(transparent)]
    Poisoned(#[from] Poisoned),
    #[error("Not possible while a sweep is running")]
    SweepRunning,
}

/// What the rig is characterising.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperatingMode {
    /// Fuel cell: the load draws current from the cell.
    #[default]
    Generation,
    /// Electrolyzer: the supply drives the cell.
    Electrolysis,
}

impl OperatingMode {
    pub fn sweep_mode(self) -> SweepMode {
        match self {
            OperatingMode::Generation => SweepMode::LoadRamp,
            OperatingMode::Electrolysis => SweepMode::SupplyRamp,
        }
    }

    /// Value of the `mode` output column.
    pub fn column(self) -> u8 {
        self.sweep_mode().column()
    }

    /// File name prefix for sweep logs in this mode.
    pub fn sweep_file_prefix(self) -> &'static str {
        match self {
            OperatingMode::Generation => GENERATION_SWEEP_PREFIX,
            OperatingMode::Electrolysis => ELECTROLYSIS_SWEEP_PREFIX,
        }
    }
}

pub type RigResult<T, L, P> = core::result::Result<
    T,
    RigError<<L as embedded_io::ErrorType>::Error, <P as embedded_io::ErrorType>::Error>,
>;

pub struct Rig<L, P>
where
    L: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
    P: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
{
    load: Shared<LoadController<L>>,
    supply: Shared<SupplyController<P>>,
    sweep: SweepController,
    mode: OperatingMode,
    hydrogen: HydrogenRate,
    started: Instant,
}

impl<L, P> Rig<L, P>
where
    L: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write + Send + 'static,
    P: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write + Send + 'static,
{
    /// Take both instruments. No commands are sent; call [Self::set_mode] to configure them.
    pub fn new(load: LoadController<L>, supply: SupplyController<P>) -> Self {
        Self {
            load: Shared::new("load", load),
            supply: Shared::new("supply", supply),
            sweep: SweepController::new(),
            mode: OperatingMode::default(),
            hydrogen: HydrogenRate::default(),
            started: Instant::now(),
        }
    }

    pub fn with_hydrogen(mut self, hydrogen: HydrogenRate) -> Self {
        self.hydrogen = hydrogen;
        self
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn load(&self) -> &Shared<LoadController<L>> {
        &self.load
    }

    pub fn supply(&self) -> &Shared<SupplyController<P>> {
        &self.supply
    }

    pub fn sweep(&self) -> &SweepController {
        &self.sweep
    }

    /// Switch the instruments over to `mode`.
    ///
    /// Generation turns the load input on and the supply output off, electrolysis the reverse.
    /// The instrument being released is switched first. Refused while a sweep is running.
    pub fn set_mode(&mut self, mode: OperatingMode) -> RigResult<(), L, P> {
        if self.sweep.is_running() {
            return Err(RigError::SweepRunning);
        }
        match mode {
            OperatingMode::Generation => {
                self.supply
                    .lock()?
                    .set_output_enabled(State::Off)
                    .map_err(RigError::Supply)?;
                self.load
                    .lock()?
                    .set_load_enabled(State::On)
                    .map_err(RigError::Load)?;
            }
            OperatingMode::Electrolysis => {
                self.load
                    .lock()?
                    .set_load_enabled(State::Off)
                    .map_err(RigError::Load)?;
                self.supply
                    .lock()?
                    .set_output_enabled(State::On)
                    .map_err(RigError::Supply)?;
            }
        }
        self.mode = mode;
        info!(%mode, "operating mode set");
        Ok(())
    }

    /// Set the load current (generation) or the supply voltage (electrolysis).
    pub fn apply_setpoint(&self, value: f32) -> RigResult<(), L, P> {
        match self.mode {
            OperatingMode::Generation => self
                .load
                .lock()?
                .set_current(value)
                .map_err(RigError::Load),
            OperatingMode::Electrolysis => self
                .supply
                .lock()?
                .set_voltage(value)
                .map_err(RigError::Supply),
        }
    }

    /// Read the live values. In electrolysis the current comes from the supply.
    pub fn measure(&self) -> RigResult<Measurement, L, P> {
        let measurement = self
            .load
            .lock()?
            .read_measurement()
            .map_err(RigError::Load)?;
        match self.mode {
            OperatingMode::Generation => Ok(measurement),
            OperatingMode::Electrolysis => {
                let current = self
                    .supply
                    .lock()?
                    .read_current()
                    .map_err(RigError::Supply)?;
                Ok(measurement.with_current(current))
            }
        }
    }

    /// One live row, timestamped since the rig was created.
    pub fn poll(&self) -> RigResult<Row, L, P> {
        let measurement = self.measure()?;
        Ok(self.row(Some(measurement)))
    }

    /// Like [Self::poll], but a failed read yields a row with empty measurement fields.
    pub fn sample(&self) -> Row {
        match self.measure() {
            Ok(measurement) => self.row(Some(measurement)),
            Err(e) => {
                warn!(error = %e, "live measurement failed");
                self.row(None)
            }
        }
    }

    fn row(&self, measurement: Option<Measurement>) -> Row {
        Row {
            elapsed: self.started.elapsed(),
            measurement,
            derived_rate: measurement.map(|m| self.hydrogen.litres_per_hour(m.current)),
            mode: self.mode.column(),
            setpoint: None,
        }
    }

    /// Start a sweep matching the current operating mode.
    pub fn start_sweep<K: Sink + 'static>(
        &self,
        spec: SweepSpec,
        sink: K,
    ) -> Result<SweepHandle, SweepError> {
        if spec.mode() != self.mode.sweep_mode() {
            return Err(SweepSpecError::ModeMismatch.into());
        }
        self.sweep
            .start(spec, self.load.clone(), self.supply.clone(), sink)
    }

    /// Hand the load back to its front panel. Refused while a sweep is running.
    pub fn close(&mut self) -> RigResult<(), L, P> {
        if self.sweep.is_running() {
            return Err(RigError::SweepRunning);
        }
        self.load.lock()?.set_local().map_err(RigError::Load)
    }
}
