//! Cluster status and cluster selection within the data centre.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::core::classifier::{Classifier, UtilizationClass};
use crate::core::common::EPSILON;
use crate::core::rack::{min_host_activations, RackDescription, RackRecord, StatusVector};
use crate::core::status_store::{StatusSnapshot, StatusStore};
use crate::core::vm::VmSnapshot;

/// Cluster status reported to the data centre manager.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub timestamp: f64,
    pub cluster_id: u32,
    pub active_racks: u32,
    /// Status vector of the valid active rack with the fewest active hosts.
    pub vector: Option<StatusVector>,
    pub cpu_in_use: f64,
    pub cpu_capacity: f64,
    pub vm_count: u32,
    pub power: f64,
}

impl ClusterStatus {
    pub fn initial(cluster_id: u32) -> Self {
        Self {
            timestamp: 0.,
            cluster_id,
            active_racks: 0,
            vector: None,
            cpu_in_use: 0.,
            cpu_capacity: 0.,
            vm_count: 0,
            power: 0.,
        }
    }

    /// Aggregates last confirmed statuses of the racks.
    pub fn from_racks(cluster_id: u32, time: f64, racks: &IndexMap<u32, RackRecord>) -> Self {
        let mut status = Self::initial(cluster_id);
        status.timestamp = time;
        let mut least_loaded: Option<&StatusVector> = None;
        for rack in racks.values() {
            let current = rack.store.current();
            status.cpu_in_use += current.cpu_in_use;
            status.cpu_capacity += current.cpu_capacity;
            status.vm_count += current.vm_count;
            status.power += current.power;
            if !rack.active {
                continue;
            }
            status.active_racks += 1;
            if rack.store.is_valid() && least_loaded.map_or(true, |v| current.vector.active < v.active) {
                least_loaded = Some(&current.vector);
            }
        }
        status.vector = least_loaded.copied();
        status
    }
}

impl StatusSnapshot for ClusterStatus {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn is_active(&self) -> bool {
        self.active_racks > 0
    }

    fn cpu_in_use(&self) -> f64 {
        self.cpu_in_use
    }

    fn is_empty(&self) -> bool {
        self.vm_count == 0
    }
}

/// Rack model shared by all racks of a cluster.
#[derive(Clone)]
pub struct ClusterDescription {
    pub rack: RackDescription,
    pub rack_count: u32,
}

impl ClusterDescription {
    pub fn power_efficiency(&self) -> f64 {
        self.rack.power_efficiency()
    }
}

/// What the data centre manager knows about one of its clusters.
#[derive(Clone)]
pub struct ClusterRecord {
    pub id: u32,
    pub description: ClusterDescription,
    pub store: StatusStore<ClusterStatus>,
    pub active: bool,
}

impl ClusterRecord {
    pub fn new(id: u32, description: ClusterDescription, window: usize) -> Self {
        Self {
            id,
            description,
            store: StatusStore::new(ClusterStatus::initial(id), window),
            active: false,
        }
    }

    pub fn classify(&self, classifier: &Classifier) -> Option<UtilizationClass> {
        classifier.classify(&self.store, |s| s.cpu_capacity)
    }

    /// Whether the least loaded rack of the cluster can host the VMs.
    pub fn least_loaded_rack_fits(&self, vms: &[VmSnapshot], target_utilization: f64) -> bool {
        self.store.current().vector.map_or(false, |vector| {
            min_host_activations(vms, &vector, &self.description.rack.host, target_utilization).is_some()
        })
    }

    pub fn has_inactive_racks(&self) -> bool {
        self.store.current().active_racks < self.description.rack_count
    }
}

/// Chooses the cluster for a group of VMs.
///
/// Clusters whose host model can't run the VMs are skipped, the rest are visited in groups of
/// equal power efficiency, most efficient first. Within a group a valid active cluster whose
/// least loaded rack can host the VMs wins, then the active cluster with the most active racks
/// which still has inactive ones. If no group yields a cluster, the first inactive capable
/// cluster is taken. Clusters in `exclude` are never chosen.
pub fn select_cluster<'a>(
    clusters: impl Iterator<Item = &'a ClusterRecord>,
    vms: &[VmSnapshot],
    exclude: &BTreeSet<u32>,
    classifier: &Classifier,
) -> Option<u32> {
    let target = classifier.thresholds.target;
    let mut capable: Vec<&ClusterRecord> = clusters
        .filter(|c| !exclude.contains(&c.id) && c.description.rack.is_capable(vms))
        .collect();
    capable.sort_by(|a, b| b.description.power_efficiency().total_cmp(&a.description.power_efficiency()));

    let mut start = 0;
    while start < capable.len() {
        let efficiency = capable[start].description.power_efficiency();
        let end = capable[start..]
            .iter()
            .position(|c| (c.description.power_efficiency() - efficiency).abs() > EPSILON)
            .map_or(capable.len(), |pos| start + pos);
        let candidates: Vec<&ClusterRecord> = capable[start..end]
            .iter()
            .copied()
            .filter(|c| c.active && c.store.is_valid() && c.classify(classifier) != Some(UtilizationClass::Stressed))
            .collect();
        if let Some(c) = candidates.iter().find(|c| c.least_loaded_rack_fits(vms, target)) {
            return Some(c.id);
        }
        let mut most_active: Option<&ClusterRecord> = None;
        for c in candidates.iter().filter(|c| c.has_inactive_racks()) {
            if most_active.map_or(true, |m| c.store.current().active_racks > m.store.current().active_racks) {
                most_active = Some(c);
            }
        }
        if let Some(c) = most_active {
            return Some(c.id);
        }
        start = end;
    }

    capable
        .iter()
        .find(|c| !c.active && c.store.is_valid())
        .map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{StressPolicy, Thresholds};
    use crate::core::common::Resources;
    use crate::core::host::HostDescription;
    use crate::core::power_model::LinearPowerModel;
    use crate::core::vm::{TaskConstraint, VmStatus};

    fn vm(cores: u32) -> VmSnapshot {
        VmSnapshot {
            id: 1,
            app_id: 1,
            task_id: 0,
            constraint: TaskConstraint::Independent,
            cores,
            core_capacity: 2500,
            resources_in_use: Resources::new((cores * 2500) as f64, 1024, 100, 100),
            status: VmStatus::Pending,
        }
    }

    fn cluster(id: u32, cores: u32, max_power: f64, active: bool, active_racks: u32, vector: Option<StatusVector>) -> ClusterRecord {
        let host = HostDescription::new(cores, 2500, 16384, 102400, 102400, Box::new(LinearPowerModel::new(max_power, 100.)));
        let mut record = ClusterRecord::new(
            id,
            ClusterDescription {
                rack: RackDescription { host, host_count: 4 },
                rack_count: 3,
            },
            3,
        );
        record.active = active;
        record.store.push(ClusterStatus {
            timestamp: 1.,
            cluster_id: id,
            active_racks,
            vector,
            cpu_in_use: 1000. * active_racks as f64,
            cpu_capacity: 20000. * active_racks as f64,
            vm_count: active_racks,
            power: 0.,
        });
        record
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
    fn test_select_cluster() {
        let full = StatusVector {
            active: 4,
            ..Default::default()
        };
        let mut roomy = full;
        roomy.slots[4] = 1;
        let clusters = vec![
            // less efficient but has room
            cluster(0, 8, 400., true, 1, Some(roomy)),
            // most efficient, full but with inactive racks
            cluster(1, 8, 250., true, 2, Some(full)),
            cluster(2, 8, 250., true, 1, Some(full)),
            cluster(3, 8, 250., false, 0, None),
            // can't run 4-core VMs
            cluster(4, 2, 100., false, 0, None),
        ];
        let c = classifier();
        let vms = vec![vm(4)];
        assert_eq!(select_cluster(clusters.iter(), &vms, &BTreeSet::new(), &c), Some(1));
        assert_eq!(select_cluster(clusters.iter(), &vms, &BTreeSet::from([1]), &c), Some(2));
        assert_eq!(select_cluster(clusters.iter(), &vms, &BTreeSet::from([1, 2]), &c), Some(0));
        assert_eq!(select_cluster(clusters.iter(), &vms, &BTreeSet::from([0, 1, 2]), &c), Some(3));
        assert_eq!(select_cluster(clusters.iter(), &vms, &BTreeSet::from([0, 1, 2, 3]), &c), None);
        // small VM fits on the most efficient cluster
        assert_eq!(select_cluster(clusters.iter(), &[vm(1)], &BTreeSet::new(), &c), Some(1));
    }
}
