//! Resource load models.

use dyn_clone::{clone_trait_object, DynClone};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A resource load model is a function, which defines the fraction of VM CPU demand in use at the moment.
/// time - current simulation time, time_from_start - time since the VM was started on its current host
/// (dropped to zero when VM is migrated).
pub trait LoadModel: DynClone {
    fn get_resource_load(&self, time: f64, time_from_start: f64) -> f64;
}

clone_trait_object!(LoadModel);

/// The simplest load model, the constant load.
#[derive(Clone)]
pub struct ConstLoadModel {
    load: f64,
}

impl ConstLoadModel {
    pub fn new(load: f64) -> Self {
        Self { load }
    }
}

impl LoadModel for ConstLoadModel {
    fn get_resource_load(&self, _time: f64, _time_from_start: f64) -> f64 {
        self.load
    }
}

/// Piecewise-constant load over simulation time.
///
/// Each step is `(from_time, load)`, steps must be sorted by time. Before the first step the load is zero.
#[derive(Clone)]
pub struct StepLoadModel {
    steps: Vec<(f64, f64)>,
}

impl StepLoadModel {
    pub fn new(steps: Vec<(f64, f64)>) -> Self {
        Self { steps }
    }
}

impl LoadModel for StepLoadModel {
    fn get_resource_load(&self, time: f64, _time_from_start: f64) -> f64 {
        self.steps
            .iter()
            .take_while(|(from, _)| *from <= time)
            .last()
            .map(|(_, load)| *load)
            .unwrap_or(0.)
    }
}

/// Base load with uniform noise which changes once per `interval`.
///
/// Noise values are derived from the seed and the interval number only, so the model
/// returns the same load for the same time regardless of how often it is queried.
#[derive(Clone)]
pub struct NoisyLoadModel {
    base: f64,
    amplitude: f64,
    interval: f64,
    seed: u64,
}

impl NoisyLoadModel {
    pub fn new(base: f64, amplitude: f64, interval: f64, seed: u64) -> Self {
        Self {
            base,
            amplitude,
            interval,
            seed,
        }
    }
}

impl LoadModel for NoisyLoadModel {
    fn get_resource_load(&self, time: f64, _time_from_start: f64) -> f64 {
        let bucket = (time / self.interval).floor() as u64;
        let mut rng = StdRng::seed_from_u64(self.seed ^ bucket.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let noise = rng.gen_range(-self.amplitude..=self.amplitude);
        (self.base + noise).clamp(0., 1.)
    }
}
