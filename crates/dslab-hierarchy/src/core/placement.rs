//! Greedy placement of constrained VM groups onto ordered candidate hosts.

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::core::common::{AllocationVerdict, Resources};
use crate::core::host_pool::{HostPool, HostRecord};
use crate::core::vm::{TaskConstraint, VmSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub vm_id: u32,
    pub host_id: u32,
}

/// Placement batch failed, `placed` holds the reservations made before the failure.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("no feasible target for vm #{vm_id}")]
pub struct PlacementFailure {
    pub vm_id: u32,
    pub placed: Vec<Assignment>,
}

/// VMs partitioned by their co-location constraint.
///
/// Groups keep the order in which their first member was seen.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstraintGroups {
    /// VMs of the same application and affinity group, each set must share one host.
    pub affinity: Vec<Vec<VmSnapshot>>,
    /// Instances of the same anti-affinity task, each must be on a distinct host.
    pub anti_affinity: Vec<Vec<VmSnapshot>>,
    pub independent: Vec<VmSnapshot>,
}

impl ConstraintGroups {
    pub fn from_vms(vms: impl IntoIterator<Item = VmSnapshot>) -> Self {
        let mut affinity: IndexMap<(u32, u32), Vec<VmSnapshot>> = IndexMap::new();
        let mut anti_affinity: IndexMap<(u32, u32), Vec<VmSnapshot>> = IndexMap::new();
        let mut independent = Vec::new();
        for vm in vms {
            match vm.constraint {
                TaskConstraint::Affinity { group } => affinity.entry((vm.app_id, group)).or_default().push(vm),
                TaskConstraint::AntiAffinity => anti_affinity.entry((vm.app_id, vm.task_id)).or_default().push(vm),
                TaskConstraint::Independent => independent.push(vm),
            }
        }
        Self {
            affinity: affinity.into_values().collect(),
            anti_affinity: anti_affinity.into_values().collect(),
            independent,
        }
    }

    /// Total number of VMs.
    pub fn len(&self) -> usize {
        self.affinity.iter().map(|g| g.len()).sum::<usize>()
            + self.anti_affinity.iter().map(|g| g.len()).sum::<usize>()
            + self.independent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aggregate requirement of a set of VMs placed on one host.
pub fn aggregate_demand(vms: &[VmSnapshot]) -> (u32, u32, Resources) {
    let cores = vms.iter().map(|vm| vm.cores).max().unwrap_or(0);
    let core_capacity = vms.iter().map(|vm| vm.core_capacity).max().unwrap_or(0);
    let demand = vms.iter().map(|vm| &vm.resources_in_use).sum();
    (cores, core_capacity, demand)
}

/// Checks that all `vms` can be added to the sandbox of `host` without exceeding the target
/// ceiling and without co-locating two instances of an anti-affinity task.
pub fn fits(host: &HostRecord, vms: &[VmSnapshot], target_utilization: f64) -> bool {
    let status = host.store.sandbox();
    let (cores, core_capacity, demand) = aggregate_demand(vms);
    let verdict = host.description.can_host(
        &status.resources_in_use(),
        cores,
        core_capacity,
        &demand,
        target_utilization,
    );
    if verdict != AllocationVerdict::Success {
        return false;
    }
    !vms.iter()
        .any(|vm| vm.constraint == TaskConstraint::AntiAffinity && status.hosts_task_of(vm))
}

fn reserve(pool: &mut HostPool, host_id: u32, vm: &VmSnapshot, assignments: &mut Vec<Assignment>) {
    if let Some(host) = pool.get_mut(host_id) {
        host.store.sandbox_mut().instantiate(vm.clone());
        assignments.push(Assignment { vm_id: vm.id, host_id });
    }
}

/// Places VM onto the first feasible target.
pub fn place_vm_wherever(pool: &mut HostPool, vm: &VmSnapshot, targets: &[u32], target_utilization: f64) -> Option<u32> {
    let host_id = targets
        .iter()
        .copied()
        .find(|id| pool.get(*id).map_or(false, |h| fits(h, std::slice::from_ref(vm), target_utilization)))?;
    if let Some(host) = pool.get_mut(host_id) {
        host.store.sandbox_mut().instantiate(vm.clone());
    }
    Some(host_id)
}

fn place_vms_together(
    pool: &mut HostPool,
    vms: &[VmSnapshot],
    targets: &[u32],
    target_utilization: f64,
    assignments: &mut Vec<Assignment>,
) -> bool {
    let host_id = match targets
        .iter()
        .copied()
        .find(|id| pool.get(*id).map_or(false, |h| fits(h, vms, target_utilization)))
    {
        Some(id) => id,
        None => return false,
    };
    for vm in vms {
        reserve(pool, host_id, vm, assignments);
    }
    true
}

fn place_vms_apart(
    pool: &mut HostPool,
    vms: &[VmSnapshot],
    targets: &[u32],
    target_utilization: f64,
    assignments: &mut Vec<Assignment>,
) -> Result<(), u32> {
    let mut candidates = targets.to_vec();
    for vm in vms {
        let pos = candidates
            .iter()
            .position(|id| pool.get(*id).map_or(false, |h| fits(h, std::slice::from_ref(vm), target_utilization)))
            .ok_or(vm.id)?;
        let host_id = candidates.remove(pos);
        reserve(pool, host_id, vm, assignments);
    }
    Ok(())
}

/// Places the whole batch: affinity groups, then anti-affinity groups, then independent VMs.
///
/// Reservations are applied to host sandboxes. On failure nothing is undone here, the caller
/// rolls back [`PlacementFailure::placed`].
pub fn place(
    pool: &mut HostPool,
    groups: &ConstraintGroups,
    targets: &[u32],
    target_utilization: f64,
) -> Result<Vec<Assignment>, PlacementFailure> {
    let mut assignments = Vec::with_capacity(groups.len());
    for group in groups.affinity.iter() {
        if !place_vms_together(pool, group, targets, target_utilization, &mut assignments) {
            return Err(PlacementFailure {
                vm_id: group[0].id,
                placed: assignments,
            });
        }
    }
    for group in groups.anti_affinity.iter() {
        if let Err(vm_id) = place_vms_apart(pool, group, targets, target_utilization, &mut assignments) {
            return Err(PlacementFailure {
                vm_id,
                placed: assignments,
            });
        }
    }
    for vm in groups.independent.iter() {
        match place_vm_wherever(pool, vm, targets, target_utilization) {
            Some(host_id) => assignments.push(Assignment { vm_id: vm.id, host_id }),
            None => {
                return Err(PlacementFailure {
                    vm_id: vm.id,
                    placed: assignments,
                })
            }
        }
    }
    assert_eq!(
        assignments.len(),
        groups.len(),
        "placement produced {} assignments for {} VMs",
        assignments.len(),
        groups.len()
    );
    Ok(assignments)
}

/// Undoes sandbox reservations.
pub fn rollback(pool: &mut HostPool, assignments: &[Assignment]) {
    for a in assignments.iter().rev() {
        if let Some(host) = pool.get_mut(a.host_id) {
            host.store.sandbox_mut().withdraw(a.vm_id);
        }
    }
}
