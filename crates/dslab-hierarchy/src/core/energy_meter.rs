//! Host energy accounting.
//!
//! Power draw is assumed constant between two recorded changes, so the meter integrates a step
//! function and keeps the time the host spent in each power state.

use std::collections::BTreeMap;

use crate::core::host::PowerState;

/// Energy consumed by a single host and its time split by power state.
#[derive(Debug, Clone)]
pub struct EnergyMeter {
    energy: f64,
    power: f64,
    state: PowerState,
    since: f64,
    durations: BTreeMap<PowerState, f64>,
}

impl EnergyMeter {
    /// Creates meter for a host which is in `state` at time zero and draws no power yet.
    pub fn new(state: PowerState) -> Self {
        Self {
            energy: 0.,
            power: 0.,
            state,
            since: 0.,
            durations: BTreeMap::new(),
        }
    }

    /// Closes the current step at `time` and starts a new one with the given power and state.
    ///
    /// Records from the past are ignored.
    pub fn record(&mut self, time: f64, power: f64, state: PowerState) {
        if time < self.since {
            return;
        }
        let elapsed = time - self.since;
        self.energy += elapsed * self.power;
        *self.durations.entry(self.state).or_insert(0.) += elapsed;
        self.power = power;
        self.state = state;
        self.since = time;
    }

    /// Energy consumed until `time`, extrapolating the current step.
    pub fn energy_until(&self, time: f64) -> f64 {
        self.energy + (time - self.since).max(0.) * self.power
    }

    /// Total time spent in `state` until `time`.
    pub fn time_in(&self, state: PowerState, time: f64) -> f64 {
        let closed = self.durations.get(&state).copied().unwrap_or(0.);
        if state == self.state {
            closed + (time - self.since).max(0.)
        } else {
            closed
        }
    }

    pub fn current_power(&self) -> f64 {
        self.power
    }
}
