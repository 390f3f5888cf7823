//! Host description and host status reports.

use serde::{Deserialize, Serialize};

use crate::core::common::{AllocationVerdict, Resources, EPSILON};
use crate::core::power_model::PowerModel;
use crate::core::status_store::StatusSnapshot;
use crate::core::vm::VmSnapshot;

/// Power state of a physical host. Ordered from the least to the most available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    Suspended,
    On,
}

/// Static host characteristics: capability limits, consumable capacity and power model.
#[derive(Clone)]
pub struct HostDescription {
    pub cores: u32,
    pub core_capacity: u32,
    pub capacity: Resources,
    pub power_model: Box<dyn PowerModel>,
}

impl HostDescription {
    pub fn new(cores: u32, core_capacity: u32, memory: u64, bandwidth: u64, storage: u64, power_model: Box<dyn PowerModel>) -> Self {
        Self {
            cores,
            core_capacity,
            capacity: Resources::new(cores as f64 * core_capacity as f64, memory, bandwidth, storage),
            power_model,
        }
    }

    pub fn max_power(&self) -> f64 {
        self.power_model.get_power(0., 1.)
    }

    /// CPU shares per watt at full load.
    pub fn power_efficiency(&self) -> f64 {
        self.capacity.cpu / self.max_power()
    }

    /// Capacity usable for planning, CPU is capped by the target utilization.
    pub fn ceiling(&self, target_utilization: f64) -> Resources {
        Resources {
            cpu: self.capacity.cpu * target_utilization,
            ..self.capacity
        }
    }

    /// Checks capability limits and free capacity below the target ceiling for a VM (or a set
    /// of VMs described by the maximum cores, the maximum core capacity and the total demand).
    pub fn can_host(
        &self,
        in_use: &Resources,
        cores: u32,
        core_capacity: u32,
        demand: &Resources,
        target_utilization: f64,
    ) -> AllocationVerdict {
        if cores > self.cores {
            return AllocationVerdict::NotEnoughCores;
        }
        if core_capacity > self.core_capacity {
            return AllocationVerdict::CoreCapacityTooLow;
        }
        let limit = self.ceiling(target_utilization);
        let total = *in_use + *demand;
        if total.cpu > limit.cpu + EPSILON {
            return AllocationVerdict::NotEnoughCPU;
        }
        if total.memory > limit.memory {
            return AllocationVerdict::NotEnoughMemory;
        }
        if total.bandwidth > limit.bandwidth {
            return AllocationVerdict::NotEnoughBandwidth;
        }
        if total.storage > limit.storage {
            return AllocationVerdict::NotEnoughStorage;
        }
        AllocationVerdict::Success
    }
}

/// Host status as reported by the host manager, also used as mutable sandbox during planning.
#[derive(Clone, Debug, Serialize)]
pub struct HostStatus {
    pub timestamp: f64,
    pub host_id: u32,
    pub state: PowerState,
    pub incoming_migrations: u32,
    pub outgoing_migrations: u32,
    /// Resident, starting and incoming VMs.
    pub vms: Vec<VmSnapshot>,
    pub power: f64,
}

impl HostStatus {
    pub fn new(host_id: u32, state: PowerState, timestamp: f64) -> Self {
        Self {
            timestamp,
            host_id,
            state,
            incoming_migrations: 0,
            outgoing_migrations: 0,
            vms: Vec::new(),
            power: 0.,
        }
    }

    pub fn resources_in_use(&self) -> Resources {
        self.vms.iter().map(|vm| &vm.resources_in_use).sum()
    }

    pub fn cpu_utilization(&self, capacity: &Resources) -> f64 {
        self.resources_in_use().cpu / capacity.cpu
    }

    pub fn has_migrations(&self) -> bool {
        self.incoming_migrations > 0 || self.outgoing_migrations > 0
    }

    pub fn vm(&self, vm_id: u32) -> Option<&VmSnapshot> {
        self.vms.iter().find(|vm| vm.id == vm_id)
    }

    /// Whether an instance of the same task as `vm` already lives here.
    pub fn hosts_task_of(&self, vm: &VmSnapshot) -> bool {
        self.vms.iter().any(|other| other.id != vm.id && other.is_same_task(vm))
    }

    /// Reserves space for a VM arriving from outside of the host (new or migrated from another scope).
    pub fn instantiate(&mut self, vm: VmSnapshot) {
        self.vms.push(vm);
        self.incoming_migrations += 1;
    }

    /// Reverts [`HostStatus::instantiate`].
    pub fn withdraw(&mut self, vm_id: u32) -> Option<VmSnapshot> {
        let vm = self.remove_vm(vm_id)?;
        self.incoming_migrations -= 1;
        Some(vm)
    }

    pub fn migrate_out(&mut self, vm_id: u32) -> Option<VmSnapshot> {
        let vm = self.remove_vm(vm_id)?;
        self.outgoing_migrations += 1;
        Some(vm)
    }

    pub fn undo_migrate_out(&mut self, vm: VmSnapshot) {
        self.vms.push(vm);
        self.outgoing_migrations -= 1;
    }

    fn remove_vm(&mut self, vm_id: u32) -> Option<VmSnapshot> {
        let pos = self.vms.iter().position(|vm| vm.id == vm_id)?;
        Some(self.vms.remove(pos))
    }
}

impl StatusSnapshot for HostStatus {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn is_active(&self) -> bool {
        self.state == PowerState::On
    }

    fn cpu_in_use(&self) -> f64 {
        self.resources_in_use().cpu
    }

    fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}
