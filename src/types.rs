//! Value types shared between the instrument drivers and the sweep.

use serde::{Deserialize, Serialize};

/// Used to be less ambiguous about whether something is on or off.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// Disabled.
    #[default]
    Off = 0x00,
    /// Enabled.
    On = 0x01,
}

impl From<State> for bool {
    fn from(value: State) -> Self {
        match value {
            State::Off => false,
            State::On => true,
        }
    }
}

impl From<bool> for State {
    fn from(value: bool) -> Self {
        match value {
            true => State::On,
            false => State::Off,
        }
    }
}

/// One voltage/current/power reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    /// Volts.
    pub voltage: f32,
    /// Amps.
    pub current: f32,
    /// Watts.
    pub power: f32,
}

impl Measurement {
    pub fn new(voltage: f32, current: f32, power: f32) -> Self {
        Self {
            voltage,
            current,
            power,
        }
    }

    /// Replace the current and recompute power from it.
    ///
    /// Used when the current is measured by the supply rather than by the load.
    pub fn with_current(self, current: f32) -> Self {
        Self {
            voltage: self.voltage,
            current,
            power: self.voltage * current,
        }
    }
}

/// Charge per mole of electrons in ampere-hours.
pub const FARADAY_AH_PER_MOL: f32 = 26.801;

/// Hydrogen production rate of an electrolyzer stack, derived from its current.
///
/// Two electrons are transferred per H2 molecule, and every cell of the stack carries the same
/// current.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrogenRate {
    pub cells: u32,
    /// Molar volume of the gas in litres.
    pub molar_volume_l: f32,
}

impl Default for HydrogenRate {
    fn default() -> Self {
        Self {
            cells: 20,
            molar_volume_l: 23.8,
        }
    }
}

impl HydrogenRate {
    /// Normal litres per hour at `current` amps.
    pub fn litres_per_hour(&self, current: f32) -> f32 {
        current / FARADAY_AH_PER_MOL / 2.0 * self.molar_volume_l * self.cells as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bool_conversions() {
        assert_eq!(State::from(true), State::On);
        assert!(!bool::from(State::default()));
        assert_eq!(State::On as u8, 1);
    }

    #[test]
    fn with_current_recomputes_power() {
        let measured = Measurement::new(2.0, 0.0, 99.0).with_current(1.5);
        assert_eq!(measured, Measurement::new(2.0, 1.5, 3.0));
    }

    #[test]
    fn hydrogen_rate_of_default_stack() {
        let rate = HydrogenRate::default();
        approx::assert_relative_eq!(rate.litres_per_hour(0.0), 0.0);
        approx::assert_relative_eq!(
            rate.litres_per_hour(26.801),
            0.5 * 23.8 * 20.0,
            max_relative = 1e-5
        );
    }
}
