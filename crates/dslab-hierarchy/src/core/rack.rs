//! Rack status vector, minimum host activations and rack selection within a cluster.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::classifier::{Classifier, UtilizationClass};
use crate::core::common::Resources;
use crate::core::host::{HostDescription, PowerState};
use crate::core::host_pool::HostPool;
use crate::core::placement::{aggregate_demand, ConstraintGroups};
use crate::core::status_store::{StatusSnapshot, StatusStore};
use crate::core::vm::VmSnapshot;

/// Standard VM size used to summarize spare capacity of a host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Flavour {
    pub name: &'static str,
    pub cores: u32,
    pub core_capacity: u32,
    pub memory: u64,
}

const FLAVOUR_BANDWIDTH: u64 = 12800;
const FLAVOUR_STORAGE: u64 = 1024;

pub const FLAVOUR_COUNT: usize = 6;

/// Flavours from the smallest to the largest.
pub const FLAVOURS: [Flavour; FLAVOUR_COUNT] = [
    Flavour { name: "xtiny", cores: 1, core_capacity: 2400, memory: 512 },
    Flavour { name: "tiny", cores: 1, core_capacity: 2400, memory: 1024 },
    Flavour { name: "small", cores: 1, core_capacity: 2500, memory: 2048 },
    Flavour { name: "medium", cores: 2, core_capacity: 2500, memory: 4096 },
    Flavour { name: "large", cores: 4, core_capacity: 2500, memory: 8192 },
    Flavour { name: "xlarge", cores: 8, core_capacity: 2500, memory: 16384 },
];

impl Flavour {
    pub fn resources(&self) -> Resources {
        Resources::new(
            (self.cores * self.core_capacity) as f64,
            self.memory,
            FLAVOUR_BANDWIDTH,
            FLAVOUR_STORAGE,
        )
    }

    /// Whether a VM set with the given requirement fits into a slot of this flavour.
    pub fn covers(&self, cores: u32, core_capacity: u32, demand: &Resources) -> bool {
        cores <= self.cores && core_capacity <= self.core_capacity && demand.fits_into(&self.resources())
    }
}

/// Index of the largest flavour fitting into spare resources of a host with given capability.
pub fn largest_flavour(spare: &Resources, host_cores: u32, host_core_capacity: u32) -> Option<usize> {
    (0..FLAVOUR_COUNT).rev().find(|i| {
        let f = &FLAVOURS[*i];
        f.cores <= host_cores && f.core_capacity <= host_core_capacity && f.resources().fits_into(spare)
    })
}

/// Summary of hosts of a rack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusVector {
    pub active: u32,
    pub suspended: u32,
    pub powered_off: u32,
    /// Number of active hosts whose largest spare flavour is the flavour with this index.
    pub slots: [u32; FLAVOUR_COUNT],
}

/// Host model shared by all hosts of a rack.
#[derive(Clone)]
pub struct RackDescription {
    pub host: HostDescription,
    pub host_count: u32,
}

impl RackDescription {
    pub fn power_efficiency(&self) -> f64 {
        self.host.power_efficiency()
    }

    /// Whether a single host satisfies the capability requirements of the VMs.
    pub fn is_capable(&self, vms: &[VmSnapshot]) -> bool {
        let (cores, core_capacity, _) = aggregate_demand(vms);
        cores <= self.host.cores && core_capacity <= self.host.core_capacity
    }
}

struct SlotSimulation<'a> {
    slots: [u32; FLAVOUR_COUNT],
    suspended: u32,
    powered_off: u32,
    activations: u32,
    host: &'a HostDescription,
    ceiling: Resources,
}

/// Part of a flavour slot left after `demand`. Slots are consumed by CPU and memory only.
fn slot_remainder(flavour: &Flavour, demand: &Resources) -> Resources {
    let full = flavour.resources();
    Resources {
        cpu: (full.cpu - demand.cpu).max(0.),
        memory: full.memory.saturating_sub(demand.memory),
        ..full
    }
}

impl<'a> SlotSimulation<'a> {
    fn reinsert(&mut self, remainder: Resources) {
        if let Some(i) = largest_flavour(&remainder, self.host.cores, self.host.core_capacity) {
            self.slots[i] += 1;
        }
    }

    /// Powers on a suspended or, failing that, a powered-off host. Returns the spare left on it.
    fn activate(&mut self, cores: u32, core_capacity: u32, demand: &Resources) -> Option<Resources> {
        if cores > self.host.cores || core_capacity > self.host.core_capacity || !demand.fits_into(&self.ceiling) {
            return None;
        }
        if self.suspended > 0 {
            self.suspended -= 1;
        } else if self.powered_off > 0 {
            self.powered_off -= 1;
        } else {
            return None;
        }
        self.activations += 1;
        Some(self.ceiling - *demand)
    }

    /// Smallest available flavour covering the demand, scanning from the largest one down.
    fn best_slot(&self, cores: u32, core_capacity: u32, demand: &Resources) -> Option<usize> {
        let mut best = None;
        for i in (0..FLAVOUR_COUNT).rev() {
            if !FLAVOURS[i].covers(cores, core_capacity, demand) {
                break;
            }
            if self.slots[i] > 0 {
                best = Some(i);
            }
        }
        best
    }

    fn place_together(&mut self, vms: &[VmSnapshot]) -> bool {
        let (cores, core_capacity, demand) = aggregate_demand(vms);
        match self.best_slot(cores, core_capacity, &demand) {
            Some(i) => {
                self.slots[i] -= 1;
                self.reinsert(slot_remainder(&FLAVOURS[i], &demand));
                true
            }
            None => match self.activate(cores, core_capacity, &demand) {
                Some(remainder) => {
                    self.reinsert(remainder);
                    true
                }
                None => false,
            },
        }
    }

    fn place_apart(&mut self, vms: &[VmSnapshot]) -> bool {
        // every member is sized as the component-wise maximum of the group
        let cores = vms.iter().map(|vm| vm.cores).max().unwrap_or(0);
        let core_capacity = vms.iter().map(|vm| vm.core_capacity).max().unwrap_or(0);
        let demand = vms
            .iter()
            .fold(Resources::default(), |acc, vm| acc.max(&vm.resources_in_use));
        let mut left = vms.len() as u32;
        let mut remainders = Vec::new();
        for i in 0..FLAVOUR_COUNT {
            if left == 0 {
                break;
            }
            if !FLAVOURS[i].covers(cores, core_capacity, &demand) {
                continue;
            }
            let taken = left.min(self.slots[i]);
            self.slots[i] -= taken;
            left -= taken;
            for _ in 0..taken {
                remainders.push(slot_remainder(&FLAVOURS[i], &demand));
            }
        }
        while left > 0 {
            match self.activate(cores, core_capacity, &demand) {
                Some(remainder) => remainders.push(remainder),
                None => return false,
            }
            left -= 1;
        }
        for remainder in remainders {
            self.reinsert(remainder);
        }
        true
    }

    fn place_single(&mut self, vm: &VmSnapshot) -> bool {
        let demand = vm.resources_in_use;
        let slot = (0..FLAVOUR_COUNT).find(|i| self.slots[*i] > 0 && FLAVOURS[*i].covers(vm.cores, vm.core_capacity, &demand));
        match slot {
            Some(i) => {
                self.slots[i] -= 1;
                self.reinsert(slot_remainder(&FLAVOURS[i], &demand));
                true
            }
            None => match self.activate(vm.cores, vm.core_capacity, &demand) {
                Some(remainder) => {
                    self.reinsert(remainder);
                    true
                }
                None => false,
            },
        }
    }
}

/// Number of hosts which must be powered on to host the VMs in a rack with given status vector,
/// or `None` if the rack can't host them at all.
pub fn min_host_activations(
    vms: &[VmSnapshot],
    vector: &StatusVector,
    host: &HostDescription,
    target_utilization: f64,
) -> Option<u32> {
    let mut sim = SlotSimulation {
        slots: vector.slots,
        suspended: vector.suspended,
        powered_off: vector.powered_off,
        activations: 0,
        host,
        ceiling: host.ceiling(target_utilization),
    };
    let groups = ConstraintGroups::from_vms(vms.iter().cloned());
    for group in groups.affinity.iter() {
        if !sim.place_together(group) {
            return None;
        }
    }
    for group in groups.anti_affinity.iter() {
        if !sim.place_apart(group) {
            return None;
        }
    }
    for vm in groups.independent.iter() {
        if !sim.place_single(vm) {
            return None;
        }
    }
    Some(sim.activations)
}

/// Rack status reported to the cluster manager.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RackStatus {
    pub timestamp: f64,
    pub rack_id: u32,
    pub vector: StatusVector,
    /// CPU in use on active hosts.
    pub cpu_in_use: f64,
    /// CPU capacity of active hosts.
    pub cpu_capacity: f64,
    pub vm_count: u32,
    pub power: f64,
}

impl RackStatus {
    /// Status of a rack before any host reports.
    pub fn initial(rack_id: u32, host_count: u32, state: PowerState) -> Self {
        let mut vector = StatusVector::default();
        match state {
            PowerState::On => vector.active = host_count,
            PowerState::Suspended => vector.suspended = host_count,
            PowerState::Off => vector.powered_off = host_count,
        }
        Self {
            timestamp: 0.,
            rack_id,
            vector,
            cpu_in_use: 0.,
            cpu_capacity: 0.,
            vm_count: 0,
            power: 0.,
        }
    }

    /// Aggregates last confirmed statuses of the hosts.
    pub fn from_hosts(rack_id: u32, time: f64, pool: &HostPool, target_utilization: f64) -> Self {
        let mut status = Self::initial(rack_id, 0, PowerState::Off);
        status.timestamp = time;
        for host in pool.iter() {
            let current = host.store.current();
            status.power += current.power;
            status.vm_count += current.vms.len() as u32;
            match current.state {
                PowerState::On => {
                    status.vector.active += 1;
                    let in_use = current.resources_in_use();
                    status.cpu_in_use += in_use.cpu;
                    status.cpu_capacity += host.description.capacity.cpu;
                    if host.store.is_valid() {
                        let spare = host.description.ceiling(target_utilization) - in_use;
                        if let Some(i) =
                            largest_flavour(&spare, host.description.cores, host.description.core_capacity)
                        {
                            status.vector.slots[i] += 1;
                        }
                    }
                }
                PowerState::Suspended => status.vector.suspended += 1,
                PowerState::Off => status.vector.powered_off += 1,
            }
        }
        status
    }
}

impl StatusSnapshot for RackStatus {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn is_active(&self) -> bool {
        self.vector.active > 0
    }

    fn cpu_in_use(&self) -> f64 {
        self.cpu_in_use
    }

    fn is_empty(&self) -> bool {
        self.vm_count == 0
    }
}

/// What a cluster manager knows about one of its racks.
#[derive(Clone)]
pub struct RackRecord {
    pub id: u32,
    pub description: RackDescription,
    pub store: StatusStore<RackStatus>,
    /// The rack hosts load and is considered before unused racks.
    pub active: bool,
}

impl RackRecord {
    pub fn new(id: u32, description: RackDescription, state: PowerState, window: usize) -> Self {
        let initial = RackStatus::initial(id, description.host_count, state);
        Self {
            id,
            description,
            store: StatusStore::new(initial, window),
            active: false,
        }
    }

    pub fn classify(&self, classifier: &Classifier) -> Option<UtilizationClass> {
        classifier.classify(&self.store, |s| s.cpu_capacity)
    }

    pub fn min_host_activations(&self, vms: &[VmSnapshot], target_utilization: f64) -> Option<u32> {
        min_host_activations(vms, &self.store.current().vector, &self.description.host, target_utilization)
    }
}

/// Chooses the rack for a group of VMs.
///
/// Among valid, active, non-stressed racks the one needing the fewest host activations wins,
/// ties go to the rack with more active hosts. Otherwise the first inactive rack able to host
/// the VMs is taken. Racks in `exclude` are never chosen.
pub fn select_rack<'a>(
    racks: impl Iterator<Item = &'a RackRecord> + Clone,
    vms: &[VmSnapshot],
    exclude: &BTreeSet<u32>,
    classifier: &Classifier,
) -> Option<u32> {
    let target = classifier.thresholds.target;
    let mut best: Option<(u32, u32, u32)> = None;
    for rack in racks.clone() {
        if !rack.active || exclude.contains(&rack.id) || !rack.store.is_valid() {
            continue;
        }
        if rack.classify(classifier) == Some(UtilizationClass::Stressed) {
            continue;
        }
        if let Some(activations) = rack.min_host_activations(vms, target) {
            let active = rack.store.current().vector.active;
            let better = match best {
                None => true,
                Some((best_activations, best_active, _)) => {
                    activations < best_activations || (activations == best_activations && active > best_active)
                }
            };
            if better {
                best = Some((activations, active, rack.id));
            }
        }
    }
    if let Some((_, _, id)) = best {
        return Some(id);
    }
    racks
        .filter(|rack| !rack.active && !exclude.contains(&rack.id) && rack.store.is_valid())
        .find(|rack| rack.min_host_activations(vms, target).is_some())
        .map(|rack| rack.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{StressPolicy, Thresholds};
    use crate::core::power_model::LinearPowerModel;
    use crate::core::vm::{TaskConstraint, VmStatus};

    fn host() -> HostDescription {
        HostDescription::new(8, 2500, 16384, 102400, 102400, Box::new(LinearPowerModel::new(250., 150.)))
    }

    fn vm(id: u32, task_id: u32, constraint: TaskConstraint, cores: u32, memory: u64) -> VmSnapshot {
        VmSnapshot {
            id,
            app_id: 1,
            task_id,
            constraint,
            cores,
            core_capacity: 2500,
            resources_in_use: Resources::new((cores * 2500) as f64, memory, 100, 100),
            status: VmStatus::Pending,
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(
            Thresholds {
                lower: 0.6,
                upper: 0.9,
                target: 0.85,
            },
            StressPolicy::AtLeastUpper,
        )
    }

    #[test]
    fn test_largest_flavour() {
        let h = host();
        assert_eq!(largest_flavour(&h.ceiling(0.85), h.cores, h.core_capacity), Some(4));
        assert_eq!(largest_flavour(&h.capacity, h.cores, h.core_capacity), Some(5));
        assert_eq!(largest_flavour(&Resources::new(2400., 600, 20000, 2000), 8, 2500), Some(0));
        assert_eq!(largest_flavour(&Resources::new(1000., 600, 20000, 2000), 8, 2500), None);
    }

    #[test]
    fn test_slots_are_used_before_activation() {
        let mut vector = StatusVector {
            active: 1,
            suspended: 1,
            powered_off: 2,
            ..Default::default()
        };
        vector.slots[3] = 1;
        let h = host();
        let small = vec![vm(1, 0, TaskConstraint::Independent, 1, 2048)];
        assert_eq!(min_host_activations(&small, &vector, &h, 0.85), Some(0));
        let two = vec![
            vm(1, 0, TaskConstraint::Independent, 2, 4096),
            vm(2, 0, TaskConstraint::Independent, 2, 4096),
        ];
        assert_eq!(min_host_activations(&two, &vector, &h, 0.85), Some(1));
    }

    #[test]
    fn test_anti_affinity_needs_distinct_hosts() {
        let vector = StatusVector {
            active: 1,
            suspended: 0,
            powered_off: 2,
            slots: [0, 0, 0, 0, 1, 0],
        };
        let h = host();
        let apart: Vec<VmSnapshot> = (0..3).map(|i| vm(i, 0, TaskConstraint::AntiAffinity, 1, 512)).collect();
        assert_eq!(min_host_activations(&apart, &vector, &h, 0.85), Some(2));
        let four: Vec<VmSnapshot> = (0..4).map(|i| vm(i, 0, TaskConstraint::AntiAffinity, 1, 512)).collect();
        assert_eq!(min_host_activations(&four, &vector, &h, 0.85), None);
    }

    #[test]
    fn test_affinity_group_takes_one_host() {
        let vector = StatusVector {
            active: 0,
            suspended: 0,
            powered_off: 1,
            ..Default::default()
        };
        let h = host();
        let together = vec![
            vm(1, 0, TaskConstraint::Affinity { group: 0 }, 4, 4096),
            vm(2, 1, TaskConstraint::Affinity { group: 0 }, 2, 4096),
        ];
        assert_eq!(min_host_activations(&together, &vector, &h, 0.85), Some(1));
        // 10 cores worth of CPU exceed the ceiling of a single host
        let too_big = vec![
            vm(1, 0, TaskConstraint::Affinity { group: 0 }, 8, 4096),
            vm(2, 1, TaskConstraint::Affinity { group: 0 }, 2, 4096),
        ];
        assert_eq!(min_host_activations(&too_big, &vector, &h, 0.85), None);
    }

    fn rack(id: u32, active: bool, vector: StatusVector) -> RackRecord {
        let mut record = RackRecord::new(
            id,
            RackDescription {
                host: host(),
                host_count: vector.active + vector.suspended + vector.powered_off,
            },
            PowerState::Off,
            3,
        );
        record.active = active;
        record.store.push(RackStatus {
            timestamp: 1.,
            rack_id: id,
            vector,
            cpu_in_use: 0.5 * vector.active as f64 * 20000.,
            cpu_capacity: vector.active as f64 * 20000.,
            vm_count: vector.active,
            power: 0.,
        });
        record
    }

    #[test]
    fn test_select_rack() {
        let vms = vec![vm(1, 0, TaskConstraint::Independent, 2, 4096)];
        let mut busy = StatusVector {
            active: 2,
            powered_off: 2,
            ..Default::default()
        };
        busy.slots[1] = 2;
        let mut roomy = StatusVector {
            active: 1,
            powered_off: 3,
            ..Default::default()
        };
        roomy.slots[4] = 1;
        let mut spare = roomy;
        spare.active = 3;
        spare.powered_off = 1;
        let racks = vec![
            rack(0, true, busy),
            rack(1, true, roomy),
            rack(2, true, spare),
            rack(3, false, StatusVector { powered_off: 4, ..Default::default() }),
        ];
        let c = classifier();
        // zero activations on racks 1 and 2, rack 2 has more active hosts
        assert_eq!(select_rack(racks.iter(), &vms, &BTreeSet::new(), &c), Some(2));
        assert_eq!(select_rack(racks.iter(), &vms, &BTreeSet::from([2]), &c), Some(1));
        assert_eq!(select_rack(racks.iter(), &vms, &BTreeSet::from([1, 2]), &c), Some(0));
        assert_eq!(select_rack(racks.iter(), &vms, &BTreeSet::from([0, 1, 2]), &c), Some(3));
        assert_eq!(select_rack(racks.iter(), &vms, &BTreeSet::from([0, 1, 2, 3]), &c), None);
    }
}
