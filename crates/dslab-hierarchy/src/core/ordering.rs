//! Data-driven orderings of hosts and VMs.
//!
//! Every ordering is a list of sort keys compared lexicographically and a single direction.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::core::classifier::Classification;
use crate::core::host_pool::{HostPool, HostRecord};
use crate::core::vm::VmSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostSortKey {
    CpuUtilization,
    PowerEfficiency,
    PowerState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmSortKey {
    CpuInUse,
    Memory,
    Cores,
    CoreCapacity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostOrdering {
    pub keys: Vec<HostSortKey>,
    pub direction: SortDirection,
}

impl HostOrdering {
    pub fn new(direction: SortDirection, keys: &[HostSortKey]) -> Self {
        Self {
            keys: keys.to_vec(),
            direction,
        }
    }

    fn key_value(key: HostSortKey, host: &HostRecord) -> f64 {
        match key {
            HostSortKey::CpuUtilization => host.utilization(),
            HostSortKey::PowerEfficiency => host.power_efficiency(),
            HostSortKey::PowerState => host.power_state() as u8 as f64,
        }
    }

    pub fn compare(&self, a: &HostRecord, b: &HostRecord) -> Ordering {
        for key in self.keys.iter() {
            let ordering = compare_f64(Self::key_value(*key, a), Self::key_value(*key, b));
            if ordering != Ordering::Equal {
                return self.direction.apply(ordering);
            }
        }
        Ordering::Equal
    }

    /// Stable sort of host ids by the sandbox state of the hosts. Unknown ids keep their place at the end.
    pub fn sort(&self, ids: &mut [u32], pool: &HostPool) {
        ids.sort_by(|a, b| match (pool.get(*a), pool.get(*b)) {
            (Some(a), Some(b)) => self.compare(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
    }

    pub fn sorted(&self, ids: &[u32], pool: &HostPool) -> Vec<u32> {
        let mut ids = ids.to_vec();
        self.sort(&mut ids, pool);
        ids
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmOrdering {
    pub keys: Vec<VmSortKey>,
    pub direction: SortDirection,
}

impl VmOrdering {
    pub fn new(direction: SortDirection, keys: &[VmSortKey]) -> Self {
        Self {
            keys: keys.to_vec(),
            direction,
        }
    }

    fn key_value(key: VmSortKey, vm: &VmSnapshot) -> f64 {
        match key {
            VmSortKey::CpuInUse => vm.resources_in_use.cpu,
            VmSortKey::Memory => vm.resources_in_use.memory as f64,
            VmSortKey::Cores => vm.cores as f64,
            VmSortKey::CoreCapacity => vm.core_capacity as f64,
        }
    }

    pub fn compare(&self, a: &VmSnapshot, b: &VmSnapshot) -> Ordering {
        for key in self.keys.iter() {
            let ordering = compare_f64(Self::key_value(*key, a), Self::key_value(*key, b));
            if ordering != Ordering::Equal {
                return self.direction.apply(ordering);
            }
        }
        Ordering::Equal
    }

    pub fn sort(&self, vms: &mut [VmSnapshot]) {
        vms.sort_by(|a, b| self.compare(a, b));
    }
}

/// Ordering of placement and relocation targets: one ordering per bucket, buckets are
/// concatenated as partially utilized, underutilized, empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetOrder {
    pub partially_utilized: HostOrdering,
    pub underutilized: HostOrdering,
    pub empty: HostOrdering,
}

impl Default for TargetOrder {
    fn default() -> Self {
        Self {
            partially_utilized: HostOrdering::new(
                SortDirection::Ascending,
                &[HostSortKey::CpuUtilization, HostSortKey::PowerEfficiency],
            ),
            underutilized: HostOrdering::new(
                SortDirection::Descending,
                &[HostSortKey::CpuUtilization, HostSortKey::PowerEfficiency],
            ),
            empty: HostOrdering::new(
                SortDirection::Descending,
                &[HostSortKey::PowerEfficiency, HostSortKey::PowerState],
            ),
        }
    }
}

impl TargetOrder {
    /// Builds candidate list, stressed hosts never appear in it.
    pub fn build(&self, classification: &Classification, pool: &HostPool) -> Vec<u32> {
        let mut targets = self.partially_utilized.sorted(&classification.partially_utilized, pool);
        targets.extend(self.underutilized.sorted(&classification.underutilized, pool));
        targets.extend(self.empty.sorted(&classification.empty, pool));
        targets
    }
}
