//! Timed linear setpoint ramps.
//!
//! A sweep drives either the load current ([SweepMode::LoadRamp]) or the supply voltage
//! ([SweepMode::SupplyRamp]) from its start value to the target in `steps` equal increments,
//! waiting `dwell` at every step before sampling. It runs on its own thread; the instruments
//! are locked per command so interactive polling can continue alongside.
//!
//! ```text
//! Idle ──start──> Running(progress) ──last step──> Completed ──start──> Running ...
//!                    │
//!                    └──cancel──> Idle
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use fugit::MillisDurationU32;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    load::LoadController,
    rig::{Poisoned, RigError, Shared},
    sink::{Row, Sink},
    supply::SupplyController,
    types::{HydrogenRate, Measurement},
};

/// Which instrument the ramp drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepMode {
    /// Ramp the load current from zero.
    #[default]
    LoadRamp,
    /// Ramp the supply voltage from the baseline.
    SupplyRamp,
}

impl SweepMode {
    /// Value of the `mode` output column.
    pub fn column(self) -> u8 {
        match self {
            SweepMode::LoadRamp => 0,
            SweepMode::SupplyRamp => 1,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle = 0,
    Running = 1,
    Completed = 2,
}

impl From<u8> for SweepState {
    fn from(value: u8) -> Self {
        match value {
            1 => SweepState::Running,
            2 => SweepState::Completed,
            _ => SweepState::Idle,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSpecError {
    #[error("A sweep needs at least one step")]
    ZeroSteps,
    #[error("Step dwell must be longer than zero")]
    ZeroDwell,
    #[error("Setpoints must be finite and not negative")]
    InvalidSetpoint,
    #[error("Sweep mode does not match the operating mode")]
    ModeMismatch,
}

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("A sweep is already running")]
    Busy,
    #[error("Invalid sweep: {0}")]
    InvalidSpec(#[from] SweepSpecError),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
    #[error("Sweep worker failed: {0}")]
    Worker(String),
}

impl From<Poisoned> for SweepError {
    fn from(value: Poisoned) -> Self {
        SweepError::LockPoisoned(value.0)
    }
}

/// Parameters of one sweep. Use [`SweepSpecBuilder`] to create one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSpec {
    target: f32,
    baseline: f32,
    steps: u32,
    dwell: MillisDurationU32,
    mode: SweepMode,
    hydrogen: HydrogenRate,
}

impl SweepSpec {
    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn baseline(&self) -> f32 {
        self.baseline
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn dwell(&self) -> MillisDurationU32 {
        self.dwell
    }

    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    /// Setpoint for step `step` of `0..=steps`.
    pub fn setpoint(&self, step: u32) -> f32 {
        let fraction = step as f32 / self.steps as f32;
        match self.mode {
            SweepMode::LoadRamp => self.target * step as f32 / self.steps as f32,
            SweepMode::SupplyRamp => self.baseline + (self.target - self.baseline) * fraction,
        }
    }

    fn dwell_duration(&self) -> Duration {
        Duration::from_millis(self.dwell.to_millis() as u64)
    }
}

pub struct SweepSpecBuilder {
    target: f32,
    baseline: f32,
    steps: u32,
    dwell: MillisDurationU32,
    mode: SweepMode,
    hydrogen: HydrogenRate,
}

impl SweepSpecBuilder {
    /// 20 steps of one second each, starting from zero.
    pub fn new(mode: SweepMode, target: f32) -> Self {
        Self {
            target,
            baseline: 0.0,
            steps: 20,
            dwell: MillisDurationU32::millis(1000),
            mode,
            hydrogen: HydrogenRate::default(),
        }
    }

    /// Start value of a supply ramp, usually the open-circuit voltage. Ignored for load ramps.
    pub fn with_baseline(mut self, baseline: f32) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_dwell(mut self, dwell: MillisDurationU32) -> Self {
        self.dwell = dwell;
        self
    }

    pub fn with_hydrogen(mut self, hydrogen: HydrogenRate) -> Self {
        self.hydrogen = hydrogen;
        self
    }

    pub fn build(self) -> Result<SweepSpec, SweepSpecError> {
        if self.steps == 0 {
            return Err(SweepSpecError::ZeroSteps);
        }
        if self.dwell.to_millis() == 0 {
            return Err(SweepSpecError::ZeroDwell);
        }
        let valid = |value: f32| value.is_finite() && value >= 0.0;
        if !valid(self.target) || !valid(self.baseline) {
            return Err(SweepSpecError::InvalidSetpoint);
        }
        Ok(SweepSpec {
            target: self.target,
            baseline: self.baseline,
            steps: self.steps,
            dwell: self.dwell,
            mode: self.mode,
            hydrogen: self.hydrogen,
        })
    }
}

/// One sampled step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSample {
    pub step: u32,
    pub setpoint: f32,
    /// False if the setpoint command failed; the instrument may still hold the previous value.
    pub setpoint_applied: bool,
    /// `dwell * step`.
    pub elapsed: Duration,
    /// `None` if the instruments could not be read.
    pub measurement: Option<Measurement>,
    /// Hydrogen rate in NL/h.
    pub derived_rate: Option<f32>,
    pub mode: SweepMode,
}

impl SweepSample {
    pub fn to_row(&self) -> Row {
        Row {
            elapsed: self.elapsed,
            measurement: self.measurement,
            derived_rate: self.derived_rate,
            mode: self.mode.column(),
            setpoint: self.setpoint_applied.then_some(self.setpoint),
        }
    }
}

/// Waits out the dwell of each step.
pub trait Pacer: Send + 'static {
    fn dwell(&mut self, duration: Duration);
}

/// Blocks the sweep thread for the dwell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Pacer for ThreadSleep {
    fn dwell(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cooperative cancellation, checked once per step right after the dwell.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed,
    Cancelled,
}

/// What a finished sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub outcome: SweepOutcome,
    /// Samples handed to the sink.
    pub samples: u32,
    pub setpoint_failures: u32,
    pub measurement_failures: u32,
    pub sink_failures: u32,
}

#[derive(Debug)]
struct Status {
    state: AtomicU8,
    progress: AtomicU32,
}

impl Status {
    fn set_progress(&self, progress: f32) {
        self.progress.store(progress.to_bits(), Ordering::Release);
    }

    fn set_state(&self, state: SweepState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Returns the state to Idle if the worker unwinds mid-sweep.
struct RunningGuard(Arc<Status>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let _ = self.0.state.compare_exchange(
            SweepState::Running as u8,
            SweepState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Owns the sweep state machine. At most one sweep runs at a time.
#[derive(Debug)]
pub struct SweepController {
    status: Arc<Status>,
}

impl Default for SweepController {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepController {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Status {
                state: AtomicU8::new(SweepState::Idle as u8),
                progress: AtomicU32::new(0f32.to_bits()),
            }),
        }
    }

    pub fn state(&self) -> SweepState {
        SweepState::from(self.status.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == SweepState::Running
    }

    /// Fraction of steps done, in `[0, 1]`. Never blocks.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.status.progress.load(Ordering::Acquire))
    }

    /// Start a sweep on a new thread, pacing with [ThreadSleep].
    pub fn start<L, P, K>(
        &self,
        spec: SweepSpec,
        load: Shared<LoadController<L>>,
        supply: Shared<SupplyController<P>>,
        sink: K,
    ) -> Result<SweepHandle, SweepError>
    where
        L: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write + Send + 'static,
        P: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write + Send + 'static,
        K: Sink + 'static,
    {
        self.start_with_pacer(spec, load, supply, sink, ThreadSleep)
    }

    /// Start a sweep on a new thread. Refused with [SweepError::Busy] while one is running.
    pub fn start_with_pacer<L, P, K, D>(
        &self,
        spec: SweepSpec,
        load: Shared<LoadController<L>>,
        supply: Shared<SupplyController<P>>,
        sink: K,
        pacer: D,
    ) -> Result<SweepHandle, SweepError>
    where
        L: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write + Send + 'static,
        P: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write + Send + 'static,
        K: Sink + 'static,
        D: Pacer,
    {
        self.claim()?;
        self.status.set_progress(0.0);

        let cancel = CancelToken::default();
        let worker = Worker {
            spec,
            load,
            supply,
            sink,
            pacer,
            status: self.status.clone(),
            cancel: cancel.clone(),
        };
        let thread = thread::Builder::new()
            .name("sweep".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.status.set_state(SweepState::Idle);
                SweepError::Worker(e.to_string())
            })?;

        Ok(SweepHandle { thread, cancel })
    }

    /// Move from Idle or Completed to Running.
    fn claim(&self) -> Result<(), SweepError> {
        for from in [SweepState::Idle, SweepState::Completed] {
            if self
                .status
                .state
                .compare_exchange(
                    from as u8,
                    SweepState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(SweepError::Busy)
    }
}

/// A running sweep.
#[derive(Debug)]
pub struct SweepHandle {
    thread: JoinHandle<Result<SweepSummary, SweepError>>,
    cancel: CancelToken,
}

impl SweepHandle {
    /// Ask the sweep to stop after the current dwell.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the sweep to end.
    pub fn join(self) -> Result<SweepSummary, SweepError> {
        self.thread
            .join()
            .map_err(|_| SweepError::Worker("sweep thread panicked".into()))?
    }
}

struct Worker<L, P, K, D>
where
    L: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
    P: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
{
    spec: SweepSpec,
    load: Shared<LoadController<L>>,
    supply: Shared<SupplyController<P>>,
    sink: K,
    pacer: D,
    status: Arc<Status>,
    cancel: CancelToken,
}

impl<L, P, K, D> Worker<L, P, K, D>
where
    L: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
    P: embedded_io::Read + embedded_io::ReadReady + embedded_io::Write,
    K: Sink,
    D: Pacer,
{
    fn run(mut self) -> Result<SweepSummary, SweepError> {
        let _guard = RunningGuard(self.status.clone());
        let spec = self.spec;
        info!(
            mode = ?spec.mode,
            target = spec.target,
            baseline = spec.baseline,
            steps = spec.steps,
            dwell_ms = spec.dwell.to_millis(),
            "sweep started"
        );

        let mut summary = SweepSummary {
            outcome: SweepOutcome::Completed,
            samples: 0,
            setpoint_failures: 0,
            measurement_failures: 0,
            sink_failures: 0,
        };

        for step in 0..=spec.steps {
            let setpoint = spec.setpoint(step);
            let setpoint_applied = match self.apply(setpoint)? {
                Ok(()) => true,
                Err(e) => {
                    warn!(step, setpoint, error = %e, "setpoint not applied");
                    summary.setpoint_failures += 1;
                    false
                }
            };

            self.pacer.dwell(spec.dwell_duration());
            if self.cancel.is_cancelled() {
                info!(step, "sweep cancelled");
                self.status.set_state(SweepState::Idle);
                summary.outcome = SweepOutcome::Cancelled;
                return Ok(summary);
            }

            let measurement = match self.measure()? {
                Ok(measurement) => Some(measurement),
                Err(e) => {
                    warn!(step, error = %e, "measurement failed");
                    summary.measurement_failures += 1;
                    None
                }
            };
            let sample = SweepSample {
                step,
                setpoint,
                setpoint_applied,
                elapsed: spec.dwell_duration() * step,
                measurement,
                derived_rate: measurement.map(|m| spec.hydrogen.litres_per_hour(m.current)),
                mode: spec.mode,
            };
            debug!(?sample, "sweep sample");

            match self.sink.append_row(&sample.to_row()) {
                Ok(()) => summary.samples += 1,
                Err(e) => {
                    error!(step, error = %e, "sink rejected sample");
                    summary.sink_failures += 1;
                }
            }
            self.status.set_progress(step as f32 / spec.steps as f32);
        }

        self.status.set_progress(1.0);
        self.status.set_state(SweepState::Completed);
        info!(?summary, "sweep completed");
        Ok(summary)
    }

    /// The outer error is fatal to the sweep, the inner one only to this step.
    fn apply(&self, setpoint: f32) -> Result<Result<(), RigError<L::Error, P::Error>>, Poisoned> {
        Ok(match self.spec.mode {
            SweepMode::LoadRamp => self
                .load
                .lock()?
                .set_current(setpoint)
                .map_err(RigError::Load),
            SweepMode::SupplyRamp => self
                .supply
                .lock()?
                .set_voltage(setpoint)
                .map_err(RigError::Supply),
        })
    }

    /// Read the load, and in a supply ramp take the current from the supply.
    fn measure(&self) -> Result<Result<Measurement, RigError<L::Error, P::Error>>, Poisoned> {
        let measured = self.load.lock()?.read_measurement().map_err(RigError::Load);
        Ok(match (self.spec.mode, measured) {
            (SweepMode::SupplyRamp, Ok(measurement)) => self
                .supply
                .lock()?
                .read_current()
                .map(|current| measurement.with_current(current))
                .map_err(RigError::Supply),
            (_, measured) => measured,
        })
    }
}
