//! Resource vectors and allocation verdicts shared by all management tiers.

use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing CPU shares.
pub const EPSILON: f64 = 1e-9;

/// Number of decimal digits kept in utilization values.
pub const UTILIZATION_PRECISION: i32 = 4;

/// Rounds utilization value to [`UTILIZATION_PRECISION`] digits.
pub fn round_utilization(value: f64) -> f64 {
    let factor = 10f64.powi(UTILIZATION_PRECISION);
    (value * factor).round() / factor
}

/// Consumable resource vector.
///
/// CPU is measured in shares (cores × core capacity), so it is kept as floating point value
/// since actual VM load is a fraction of its demand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: u64,
    pub bandwidth: u64,
    pub storage: u64,
}

impl Resources {
    pub fn new(cpu: f64, memory: u64, bandwidth: u64, storage: u64) -> Self {
        Self {
            cpu,
            memory,
            bandwidth,
            storage,
        }
    }

    /// Returns true if this vector does not exceed `available` in any dimension.
    pub fn fits_into(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu + EPSILON
            && self.memory <= available.memory
            && self.bandwidth <= available.bandwidth
            && self.storage <= available.storage
    }

    /// Component-wise maximum.
    pub fn max(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            bandwidth: self.bandwidth.max(other.bandwidth),
            storage: self.storage.max(other.storage),
        }
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            bandwidth: self.bandwidth + rhs.bandwidth,
            storage: self.storage + rhs.storage,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

/// Saturating subtraction, spare capacity never goes below zero.
impl Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Resources) -> Resources {
        Resources {
            cpu: (self.cpu - rhs.cpu).max(0.),
            memory: self.memory.saturating_sub(rhs.memory),
            bandwidth: self.bandwidth.saturating_sub(rhs.bandwidth),
            storage: self.storage.saturating_sub(rhs.storage),
        }
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Self {
        iter.fold(Resources::default(), |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Self {
        iter.fold(Resources::default(), |acc, r| acc + *r)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationVerdict {
    Success,
    NotEnoughCores,
    CoreCapacityTooLow,
    NotEnoughCPU,
    NotEnoughMemory,
    NotEnoughBandwidth,
    NotEnoughStorage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_keeps_four_digits() {
        assert_eq!(round_utilization(3850. / 4000.), 0.9625);
        assert_eq!(round_utilization(1. / 3.), 0.3333);
    }

    #[test]
    fn test_subtraction_saturates() {
        let a = Resources::new(100., 10, 10, 10);
        let b = Resources::new(150., 5, 20, 10);
        assert_eq!(a - b, Resources::new(0., 5, 0, 0));
    }
}
