//! Stress relief: choice of VMs to move away from a stressed host and of their targets.

use indexmap::IndexMap;
use serde::Serialize;

use crate::core::common::EPSILON;
use crate::core::host::HostStatus;
use crate::core::host_pool::HostPool;
use crate::core::ledger::{MigrationSubject, SubjectKey};
use crate::core::placement::fits;
use crate::core::vm::{TaskConstraint, VmSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub vm_id: u32,
    pub source: u32,
    pub target: u32,
}

fn constraint_rank(constraint: TaskConstraint) -> u8 {
    match constraint {
        TaskConstraint::Independent => 0,
        TaskConstraint::AntiAffinity => 1,
        TaskConstraint::Affinity { .. } => 2,
    }
}

/// Orders VMs of a stressed host for relocation.
///
/// VMs whose load is below the excess over the target utilization are dropped and the rest
/// go by increasing load. If no VM is large enough, all VMs go by decreasing load.
/// Independent VMs come first, then anti-affinity ones, then affinity ones.
pub fn order_source_vms(vms: &[VmSnapshot], average_utilization: f64, capacity: f64, target_utilization: f64) -> Vec<VmSnapshot> {
    let excess = (average_utilization - target_utilization) * capacity;
    let mut ordered: Vec<VmSnapshot> = vms
        .iter()
        .filter(|vm| vm.resources_in_use.cpu + EPSILON >= excess)
        .cloned()
        .collect();
    if ordered.is_empty() {
        ordered = vms.to_vec();
        ordered.sort_by(|a, b| b.resources_in_use.cpu.total_cmp(&a.resources_in_use.cpu));
    } else {
        ordered.sort_by(|a, b| a.resources_in_use.cpu.total_cmp(&b.resources_in_use.cpu));
    }
    ordered.sort_by_key(|vm| constraint_rank(vm.constraint));
    ordered
}

/// Groups ordered VMs into units moved as a whole: single VMs, or complete affinity sets of
/// the host (smallest set first).
pub fn relocation_units(ordered: &[VmSnapshot], resident: &[VmSnapshot]) -> Vec<Vec<VmSnapshot>> {
    let mut units = Vec::new();
    let mut affinity: IndexMap<(u32, u32), Vec<VmSnapshot>> = IndexMap::new();
    for vm in ordered {
        match vm.constraint {
            TaskConstraint::Affinity { group } => {
                affinity.entry((vm.app_id, group)).or_insert_with(|| {
                    resident
                        .iter()
                        .filter(|other| other.app_id == vm.app_id && other.constraint == vm.constraint)
                        .cloned()
                        .collect()
                });
            }
            _ => units.push(vec![vm.clone()]),
        }
    }
    let mut sets: Vec<Vec<VmSnapshot>> = affinity.into_values().collect();
    sets.sort_by(|a, b| {
        let a: f64 = a.iter().map(|vm| vm.resources_in_use.cpu).sum();
        let b: f64 = b.iter().map(|vm| vm.resources_in_use.cpu).sum();
        a.total_cmp(&b)
    });
    units.extend(sets);
    units
}

fn accepts_migration(status: &HostStatus) -> bool {
    status.incoming_migrations < 2 && status.outgoing_migrations == 0
}

/// Searches one feasible (unit, target) pair among the local hosts and applies it to the sandboxes.
///
/// Targets with two incoming migrations or any outgoing one are skipped, as are units containing
/// tracked VMs.
pub fn plan_internal(
    pool: &mut HostPool,
    source: u32,
    units: &[Vec<VmSnapshot>],
    targets: &[u32],
    is_tracked: impl Fn(u32) -> bool,
    target_utilization: f64,
) -> Option<Vec<Migration>> {
    for unit in units {
        if unit.is_empty() || unit.iter().any(|vm| is_tracked(vm.id)) {
            continue;
        }
        let target = targets.iter().copied().find(|id| {
            *id != source
                && pool
                    .get(*id)
                    .map_or(false, |h| accepts_migration(h.store.sandbox()) && fits(h, unit, target_utilization))
        });
        if let Some(target) = target {
            let mut migrations = Vec::with_capacity(unit.len());
            for vm in unit {
                if pool.migrate(vm.id, source, target) {
                    migrations.push(Migration {
                        vm_id: vm.id,
                        source,
                        target,
                    });
                }
            }
            return Some(migrations);
        }
    }
    None
}

/// Chooses what to evict to another scope: a single-VM application, else the first
/// non-affinity VM, else the first affinity VM.
///
/// `vms` must already exclude migrating VMs and VMs held for another rack.
pub fn select_external_candidate(vms: &[VmSnapshot], app_size: impl Fn(u32) -> usize) -> Option<MigrationSubject> {
    if let Some(vm) = vms.iter().find(|vm| app_size(vm.app_id) == 1) {
        return Some(MigrationSubject {
            key: SubjectKey::App(vm.app_id),
            vms: vec![vm.clone()],
        });
    }
    let vm = vms
        .iter()
        .find(|vm| !matches!(vm.constraint, TaskConstraint::Affinity { .. }))
        .or_else(|| vms.first())?;
    Some(MigrationSubject {
        key: SubjectKey::Vm(vm.id),
        vms: vec![vm.clone()],
    })
}
