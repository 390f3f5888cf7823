//! Utilization classification of hosts, racks and clusters.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::common::round_utilization;
use crate::core::host_pool::HostPool;
use crate::core::status_store::{StatusSnapshot, StatusStore};

/// Utilization bucket, ordered from the least to the most loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum UtilizationClass {
    Empty,
    Underutilized,
    PartiallyUtilized,
    Stressed,
}

/// Rule used to decide whether a resource above the upper threshold is stressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StressPolicy {
    /// Average utilization is greater than or equal to the upper threshold.
    AtLeastUpper,
    /// Average utilization is strictly greater than the upper threshold.
    AboveUpper,
    /// The two newest samples are both strictly above the upper threshold.
    LastTwoSamplesAboveUpper,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub lower: f64,
    pub upper: f64,
    pub target: f64,
}

/// Per-sample utilizations of the trailing powered-on part of the history, newest first.
///
/// The scan stops at the first sample taken while the resource was not active.
pub fn active_samples<S: StatusSnapshot>(history: &VecDeque<S>, capacity: impl Fn(&S) -> f64) -> Vec<f64> {
    history
        .iter()
        .take_while(|status| status.is_active())
        .map(|status| {
            let capacity = capacity(status);
            if capacity > 0. {
                status.cpu_in_use() / capacity
            } else {
                0.
            }
        })
        .collect()
}

/// Average CPU utilization over the active part of the history, rounded.
pub fn average_utilization<S: StatusSnapshot>(history: &VecDeque<S>, capacity: impl Fn(&S) -> f64) -> f64 {
    let samples = active_samples(history, capacity);
    if samples.is_empty() {
        return 0.;
    }
    round_utilization(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Buckets resources by their utilization history.
#[derive(Clone, Debug)]
pub struct Classifier {
    pub thresholds: Thresholds,
    pub policy: StressPolicy,
}

impl Classifier {
    pub fn new(thresholds: Thresholds, policy: StressPolicy) -> Self {
        Self { thresholds, policy }
    }

    /// Classifies resource with given history. `empty` tells whether the resource holds no VMs.
    pub fn classify_history<S: StatusSnapshot>(
        &self,
        history: &VecDeque<S>,
        empty: bool,
        capacity: impl Fn(&S) -> f64,
    ) -> UtilizationClass {
        if empty {
            return UtilizationClass::Empty;
        }
        let samples = active_samples(history, capacity);
        let average = if samples.is_empty() {
            0.
        } else {
            round_utilization(samples.iter().sum::<f64>() / samples.len() as f64)
        };
        if average < self.thresholds.lower {
            return UtilizationClass::Underutilized;
        }
        if self.is_stressed(average, &samples) {
            return UtilizationClass::Stressed;
        }
        UtilizationClass::PartiallyUtilized
    }

    /// Returns `None` for a resource whose status was consumed by a decision and not yet refreshed.
    pub fn classify<S: StatusSnapshot>(
        &self,
        store: &StatusStore<S>,
        capacity: impl Fn(&S) -> f64,
    ) -> Option<UtilizationClass> {
        if !store.is_valid() {
            return None;
        }
        Some(self.classify_history(store.history(), store.current().is_empty(), capacity))
    }

    fn is_stressed(&self, average: f64, samples: &[f64]) -> bool {
        let upper = self.thresholds.upper;
        match self.policy {
            StressPolicy::AtLeastUpper => average >= upper,
            StressPolicy::AboveUpper => average > upper,
            StressPolicy::LastTwoSamplesAboveUpper => {
                samples.len() >= 2 && samples[..2].iter().all(|u| round_utilization(*u) > upper)
            }
        }
    }

    /// Classifies all hosts of the pool with valid status.
    pub fn classify_hosts(&self, pool: &HostPool) -> Classification {
        let mut result = Classification::default();
        for host in pool.iter() {
            let capacity = host.description.capacity.cpu;
            match self.classify(&host.store, |_| capacity) {
                Some(UtilizationClass::Stressed) => result.stressed.push(host.id),
                Some(UtilizationClass::PartiallyUtilized) => result.partially_utilized.push(host.id),
                Some(UtilizationClass::Underutilized) => result.underutilized.push(host.id),
                Some(UtilizationClass::Empty) => result.empty.push(host.id),
                None => {}
            }
        }
        result
    }
}

/// Host ids split by utilization bucket, in pool order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    pub stressed: Vec<u32>,
    pub partially_utilized: Vec<u32>,
    pub underutilized: Vec<u32>,
    pub empty: Vec<u32>,
}

impl Classification {
    pub fn class_of(&self, host_id: u32) -> Option<UtilizationClass> {
        if self.stressed.contains(&host_id) {
            Some(UtilizationClass::Stressed)
        } else if self.partially_utilized.contains(&host_id) {
            Some(UtilizationClass::PartiallyUtilized)
        } else if self.underutilized.contains(&host_id) {
            Some(UtilizationClass::Underutilized)
        } else if self.empty.contains(&host_id) {
            Some(UtilizationClass::Empty)
        } else {
            None
        }
    }

    /// Hosts which may receive VMs, i.e. all valid hosts except the stressed ones.
    pub fn targets(&self) -> impl Iterator<Item = &u32> {
        self.partially_utilized
            .iter()
            .chain(self.underutilized.iter())
            .chain(self.empty.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct Sample {
        time: f64,
        on: bool,
        cpu: f64,
    }

    impl StatusSnapshot for Sample {
        fn timestamp(&self) -> f64 {
            self.time
        }

        fn is_active(&self) -> bool {
            self.on
        }

        fn cpu_in_use(&self) -> f64 {
            self.cpu
        }

        fn is_empty(&self) -> bool {
            false
        }
    }

    fn history(cpu: &[f64]) -> VecDeque<Sample> {
        // newest first
        cpu.iter()
            .rev()
            .enumerate()
            .map(|(i, c)| Sample {
                time: (cpu.len() - i) as f64,
                on: true,
                cpu: *c,
            })
            .collect()
    }

    fn classifier(lower: f64, upper: f64, policy: StressPolicy) -> Classifier {
        Classifier::new(
            Thresholds {
                lower,
                upper,
                target: upper.min(0.85),
            },
            policy,
        )
    }

    #[test]
    fn test_stressed_host() {
        let h = history(&[3800., 3850., 3900.]);
        assert_eq!(average_utilization(&h, |_| 4000.), 0.9625);
        let c = classifier(0.6, 0.9, StressPolicy::AtLeastUpper);
        assert_eq!(c.classify_history(&h, false, |_| 4000.), UtilizationClass::Stressed);
    }

    #[test]
    fn test_buckets() {
        let c = classifier(0.6, 0.9, StressPolicy::AtLeastUpper);
        assert_eq!(c.classify_history(&history(&[1200.]), true, |_| 4000.), UtilizationClass::Empty);
        assert_eq!(
            c.classify_history(&history(&[1200.]), false, |_| 4000.),
            UtilizationClass::Underutilized
        );
        assert_eq!(
            c.classify_history(&history(&[3000.]), false, |_| 4000.),
            UtilizationClass::PartiallyUtilized
        );
        assert_eq!(
            c.classify_history(&history(&[3600.]), false, |_| 4000.),
            UtilizationClass::Stressed
        );
        let strict = classifier(0.6, 0.9, StressPolicy::AboveUpper);
        assert_eq!(
            strict.classify_history(&history(&[3600.]), false, |_| 4000.),
            UtilizationClass::PartiallyUtilized
        );
    }

    #[test]
    fn test_inactive_samples_are_ignored() {
        let mut h = history(&[3600., 3600.]);
        h.push_front(Sample {
            time: 0.,
            on: false,
            cpu: 0.,
        });
        // newest sample taken while powered off
        assert_eq!(average_utilization(&h, |_| 4000.), 0.);

        let mut h = history(&[0., 3000.]);
        h.back_mut().unwrap().on = false;
        assert_eq!(average_utilization(&h, |_| 4000.), 0.75);
    }

    #[test]
    fn test_last_two_samples_policy() {
        let c = classifier(0.6, 0.9, StressPolicy::LastTwoSamplesAboveUpper);
        assert_eq!(
            c.classify_history(&history(&[3000., 3900., 3900.]), false, |_| 4000.),
            UtilizationClass::Stressed
        );
        // transient spike
        assert_eq!(
            c.classify_history(&history(&[3000., 3000., 3900.]), false, |_| 4000.),
            UtilizationClass::PartiallyUtilized
        );
        assert_eq!(
            c.classify_history(&history(&[3900.]), false, |_| 4000.),
            UtilizationClass::PartiallyUtilized
        );
    }

    #[test]
    fn test_lower_thresholds_never_decrease_class() {
        let histories = [
            history(&[100.]),
            history(&[1500., 2500.]),
            history(&[2800., 3000., 3300.]),
            history(&[3500., 3700.]),
            history(&[4000.]),
        ];
        let thresholds = [(0.6, 0.9), (0.5, 0.9), (0.5, 0.8), (0.3, 0.7), (0.1, 0.2)];
        for policy in [
            StressPolicy::AtLeastUpper,
            StressPolicy::AboveUpper,
            StressPolicy::LastTwoSamplesAboveUpper,
        ] {
            for h in histories.iter() {
                let mut prev = UtilizationClass::Empty;
                for (lower, upper) in thresholds {
                    let class = classifier(lower, upper, policy).classify_history(h, false, |_| 4000.);
                    assert!(class >= prev, "{:?} -> {:?} at lower={} upper={}", prev, class, lower, upper);
                    prev = class;
                }
            }
        }
    }
}
