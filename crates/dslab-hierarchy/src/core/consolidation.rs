//! Periodic consolidation: drains underutilized hosts so that they can be powered off.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::classifier::Classification;
use crate::core::host::PowerState;
use crate::core::host_pool::HostPool;
use crate::core::ordering::{HostOrdering, VmOrdering};
use crate::core::placement::{fits, ConstraintGroups};
use crate::core::relocation::Migration;
use crate::core::vm::VmSnapshot;

#[derive(Clone, Debug)]
pub struct ConsolidationPolicy {
    pub source_order: HostOrdering,
    pub target_order: HostOrdering,
    pub vm_order: VmOrdering,
    pub target_utilization: f64,
}

/// All migrations which empty one source host.
#[derive(Clone, Debug, PartialEq)]
pub struct Drain {
    pub source: u32,
    pub migrations: Vec<Migration>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsolidationPlan {
    /// Powered-on empty hosts to shut down right away.
    pub shutdowns: Vec<u32>,
    pub drains: Vec<Drain>,
}

/// Plans consolidation of the pool whose sandboxes were reset. Applied plans stay in the sandboxes.
///
/// `is_migrating` tells whether a VM is already involved in a migration. A host receives VMs only
/// from sources with a lower average utilization over the reported history.
pub fn plan_consolidation(
    pool: &mut HostPool,
    classification: &Classification,
    policy: &ConsolidationPolicy,
    is_migrating: impl Fn(u32) -> bool,
) -> ConsolidationPlan {
    let mut plan = ConsolidationPlan::default();

    for host_id in classification.empty.iter() {
        if let Some(host) = pool.get(*host_id) {
            let status = host.store.sandbox();
            if status.state == PowerState::On && !status.has_migrations() {
                plan.shutdowns.push(*host_id);
            }
        }
    }

    let sources: Vec<u32> = classification
        .underutilized
        .iter()
        .copied()
        .filter(|id| {
            pool.get(*id).map_or(false, |h| {
                let status = h.store.sandbox();
                !status.has_migrations() && !status.vms.iter().any(|vm| is_migrating(vm.id))
            })
        })
        .collect();
    let mut pending: VecDeque<u32> = policy.source_order.sorted(&sources, pool).into();

    let targets: Vec<u32> = classification
        .partially_utilized
        .iter()
        .chain(classification.underutilized.iter())
        .copied()
        .collect();
    let mut targets = policy.target_order.sorted(&targets, pool);
    let averages: BTreeMap<u32, f64> = pool.iter().map(|h| (h.id, h.average_utilization())).collect();

    while let Some(source) = pending.pop_front() {
        if let Some(migrations) = drain_host(pool, source, &targets, &averages, policy) {
            let used: BTreeSet<u32> = migrations.iter().map(|m| m.target).collect();
            targets.retain(|id| *id != source);
            pending.retain(|id| !used.contains(id));
            plan.drains.push(Drain { source, migrations });
        }
    }
    plan
}

/// Moves every VM of the source in the sandboxes, or nothing at all.
fn drain_host(
    pool: &mut HostPool,
    source: u32,
    targets: &[u32],
    averages: &BTreeMap<u32, f64>,
    policy: &ConsolidationPolicy,
) -> Option<Vec<Migration>> {
    let mut vms = match pool.get(source) {
        Some(host) => host.store.sandbox().vms.clone(),
        None => return None,
    };
    if vms.is_empty() {
        return None;
    }
    policy.vm_order.sort(&mut vms);
    let groups = ConstraintGroups::from_vms(vms);

    let mut migrations = Vec::new();
    let mut ok = true;
    for group in groups.affinity.iter() {
        if !move_together(pool, source, averages, group, targets, policy, &mut migrations) {
            ok = false;
            break;
        }
    }
    if ok {
        'groups: for group in groups.anti_affinity.iter() {
            let mut used = BTreeSet::new();
            for vm in group {
                let candidates: Vec<u32> = targets.iter().copied().filter(|id| !used.contains(id)).collect();
                let before = migrations.len();
                if !move_together(pool, source, averages, std::slice::from_ref(vm), &candidates, policy, &mut migrations) {
                    ok = false;
                    break 'groups;
                }
                used.extend(migrations[before..].iter().map(|m| m.target));
            }
        }
    }
    if ok {
        for vm in groups.independent.iter() {
            if !move_together(pool, source, averages, std::slice::from_ref(vm), targets, policy, &mut migrations) {
                ok = false;
                break;
            }
        }
    }
    if !ok {
        for m in migrations.iter().rev() {
            pool.unmigrate(m.vm_id, m.source, m.target);
        }
        return None;
    }
    Some(migrations)
}

fn move_together(
    pool: &mut HostPool,
    source: u32,
    averages: &BTreeMap<u32, f64>,
    vms: &[VmSnapshot],
    targets: &[u32],
    policy: &ConsolidationPolicy,
    migrations: &mut Vec<Migration>,
) -> bool {
    let source_utilization = averages.get(&source).copied().unwrap_or(0.);
    let target = targets.iter().copied().find(|id| {
        *id != source
            && averages.get(id).map_or(false, |avg| source_utilization < *avg)
            && pool.get(*id).map_or(false, |h| fits(h, vms, policy.target_utilization))
    });
    let target = match target {
        Some(target) => target,
        None => return false,
    };
    for vm in vms {
        if pool.migrate(vm.id, source, target) {
            migrations.push(Migration {
                vm_id: vm.id,
                source,
                target,
            });
        }
    }
    true
}
