use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inquire::Select;
use tracing::{info, warn};

use fuelcell_rig::{
    config::RigConfig,
    load::LoadController,
    logging::{LogFormat, LogLevel, init_logging},
    rig::{OperatingMode, Rig},
    sink::{CsvSink, LIVE_PREFIX, Row, Sink},
    supply::SupplyController,
    transport::{self, SerialTransport},
};

type SerialRig = Rig<SerialTransport, SerialTransport>;

#[derive(Parser)]
#[command(version, about = "Fuel-cell / electrolyzer test rig control", long_about = None)]
struct Cli {
    /// Configuration file. Defaults are used if it does not exist.
    #[arg(long, short, default_value = "fcrig.toml")]
    config: PathBuf,
    /// Serial port of the electronic load.
    #[arg(long)]
    load_port: Option<String>,
    /// Serial port of the power supply.
    #[arg(long)]
    supply_port: Option<String>,
    /// Operating mode: generation (fuel cell) or electrolysis.
    #[arg(long, short)]
    mode: Option<OperatingMode>,
    /// Live polling rate in Hz (1 to 60).
    #[arg(long)]
    sampling_hz: Option<f32>,
    /// Directory for CSV logs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the serial ports on this machine.
    Ports,
    /// Print a single live reading.
    Read,
    /// Poll live readings at the sampling rate, logging them to CSV.
    Monitor {
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<f32>,
        /// Print only, do not write a CSV file.
        #[arg(long)]
        no_log: bool,
    },
    /// Set the load current (generation, A) or the supply voltage (electrolysis, V).
    Set { value: f32 },
    /// Run a ramp and log every step to CSV.
    Sweep {
        /// Final current (generation) or voltage (electrolysis).
        #[arg(long)]
        target: Option<f32>,
        /// Start voltage of an electrolysis ramp.
        #[arg(long)]
        baseline: Option<f32>,
        #[arg(long)]
        steps: Option<u32>,
        #[arg(long)]
        dwell_ms: Option<u32>,
        /// Print live readings while the sweep runs.
        #[arg(long)]
        monitor: bool,
    },
}

impl Cli {
    /// Command line values take precedence over the configuration file.
    fn apply(&self, config: &mut RigConfig) {
        if let Some(port) = &self.load_port {
            config.load.port = port.clone();
        }
        if let Some(port) = &self.supply_port {
            config.supply.port = port.clone();
        }
        if let Some(mode) = self.mode {
            config.sweep.mode = mode;
        }
        if let Some(hz) = self.sampling_hz {
            config.sampling_hz = hz;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Command::Sweep {
            target,
            baseline,
            steps,
            dwell_ms,
            ..
        } = self.command
        {
            config.sweep.target = target.unwrap_or(config.sweep.target);
            config.sweep.baseline = baseline.unwrap_or(config.sweep.baseline);
            config.sweep.steps = steps.unwrap_or(config.sweep.steps);
            config.sweep.dwell_ms = dwell_ms.unwrap_or(config.sweep.dwell_ms);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = RigConfig::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;
    init_logging(&config.log);

    if let Command::Ports = cli.command {
        return list_ports();
    }

    let mut rig = open_rig(&config)?;
    let outcome = run(&cli.command, &mut rig, &config);
    if let Err(e) = rig.close() {
        warn!(error = %e, "could not return load to local control");
    }
    outcome
}

fn list_ports() -> Result<()> {
    let ports = transport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

/// Use the configured port if it exists, otherwise let the user pick one.
fn resolve_port(instrument: &str, configured: &str) -> Result<String> {
    let ports = transport::available_ports().unwrap_or_default();
    if ports.is_empty() || ports.iter().any(|port| port == configured) {
        return Ok(configured.to_owned());
    }
    warn!(instrument, port = configured, "configured port not present");
    Select::new(&format!("Select the serial port of the {instrument}:"), ports)
        .prompt()
        .with_context(|| format!("No serial port selected for the {instrument}"))
}

fn open_rig(config: &RigConfig) -> Result<SerialRig> {
    let load_port = resolve_port("electronic load", &config.load.port)?;
    let supply_port = resolve_port("power supply", &config.supply.port)?;

    let load_link = SerialTransport::open(&load_port, &config.load_link())?;
    let load = LoadController::connect(load_link)
        .with_context(|| format!("Electronic load on {load_port} did not enter remote control"))?;
    info!(port = %load_port, "electronic load connected");

    let supply_link = SerialTransport::open(&supply_port, &config.supply_link())?;
    let supply = SupplyController::new(supply_link);
    info!(port = %supply_port, "power supply connected");

    let mut rig = Rig::new(load, supply).with_hydrogen(config.hydrogen);
    rig.set_mode(config.sweep.mode)
        .context("Failed to switch operating mode")?;
    Ok(rig)
}

fn run(command: &Command, rig: &mut SerialRig, config: &RigConfig) -> Result<()> {
    match command {
        Command::Ports => list_ports(),
        Command::Read => {
            print_row(&rig.poll()?);
            Ok(())
        }
        Command::Monitor { seconds, no_log } => monitor(rig, config, *seconds, !*no_log),
        Command::Set { value } => {
            rig.apply_setpoint(*value)?;
            info!(value, mode = %rig.mode(), "setpoint applied");
            Ok(())
        }
        Command::Sweep { monitor, .. } => sweep(rig, config, *monitor),
    }
}

fn print_row(row: &Row) {
    println!("{}", row.fields().join(","));
}

fn monitor(rig: &SerialRig, config: &RigConfig, seconds: Option<f32>, log: bool) -> Result<()> {
    let mut sink = if log {
        let (path, sink) = CsvSink::create_in(&config.output_dir, LIVE_PREFIX)
            .context("Failed to create the live log")?;
        info!(path = %path.display(), "logging live readings");
        Some(sink)
    } else {
        None
    };

    let period = config.sampling_period();
    let limit = seconds.map(Duration::from_secs_f32);
    let started = Instant::now();
    loop {
        let tick = Instant::now();
        let row = rig.sample();
        print_row(&row);
        if let Some(sink) = sink.as_mut() {
            sink.append_row(&row)?;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            return Ok(());
        }
        thread::sleep(period.saturating_sub(tick.elapsed()));
    }
}

fn sweep(rig: &SerialRig, config: &RigConfig, monitor: bool) -> Result<()> {
    let spec = config.sweep_spec()?;
    let (path, sink) = CsvSink::create_in(&config.output_dir, rig.mode().sweep_file_prefix())
        .context("Failed to create the sweep log")?;
    info!(path = %path.display(), "logging sweep");

    let handle = rig.start_sweep(spec, sink)?;
    let period = config.sampling_period();
    let mut reported = -1.0;
    while !handle.is_finished() {
        if monitor {
            print_row(&rig.sample());
        }
        let progress = rig.sweep().progress();
        if progress != reported {
            eprintln!("sweep {:>3.0}%", progress * 100.0);
            reported = progress;
        }
        thread::sleep(period);
    }

    let summary = handle.join()?;
    info!(?summary, "sweep finished");
    println!("{} samples written to {}", summary.samples, path.display());
    Ok(())
}
