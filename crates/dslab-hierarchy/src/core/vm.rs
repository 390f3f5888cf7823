//! Representations of virtual machine and its status.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::core::common::Resources;
use crate::core::load_model::LoadModel;

/// Status of virtual machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VmStatus {
    Pending,
    Initializing,
    Running,
    Migrating,
}

impl Display for VmStatus {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            VmStatus::Pending => write!(f, "pending"),
            VmStatus::Initializing => write!(f, "initializing"),
            VmStatus::Running => write!(f, "running"),
            VmStatus::Migrating => write!(f, "migrating"),
        }
    }
}

/// Co-location constraint of a task and all its instances.
///
/// VMs of the same application with equal affinity group must share a host,
/// instances of an anti-affinity task must be on distinct hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskConstraint {
    Independent,
    AntiAffinity,
    Affinity { group: u32 },
}

/// Represents virtual machine (VM), i.e. one instance of an application task.
#[derive(Clone)]
pub struct VirtualMachine {
    pub id: u32,
    pub app_id: u32,
    pub task_id: u32,
    pub constraint: TaskConstraint,
    pub cores: u32,
    pub core_capacity: u32,
    /// Resource demand, the CPU part is scaled by the load model to obtain actual usage.
    pub demand: Resources,
    start_time: f64,
    cpu_load_model: Box<dyn LoadModel>,
}

impl VirtualMachine {
    pub fn new(
        id: u32,
        app_id: u32,
        task_id: u32,
        constraint: TaskConstraint,
        cores: u32,
        core_capacity: u32,
        demand: Resources,
        cpu_load_model: Box<dyn LoadModel>,
    ) -> Self {
        Self {
            id,
            app_id,
            task_id,
            constraint,
            cores,
            core_capacity,
            demand,
            start_time: 0.,
            cpu_load_model,
        }
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn set_start_time(&mut self, time: f64) {
        self.start_time = time;
    }

    pub fn get_cpu_load(&self, time: f64) -> f64 {
        self.cpu_load_model
            .get_resource_load(time, (time - self.start_time).max(0.))
    }

    /// Resources actually used by the VM at the given time.
    pub fn resources_in_use(&self, time: f64) -> Resources {
        Resources {
            cpu: self.demand.cpu * self.get_cpu_load(time),
            ..self.demand
        }
    }

    /// Snapshot with current resource usage.
    pub fn snapshot(&self, time: f64, status: VmStatus) -> VmSnapshot {
        self.make_snapshot(self.resources_in_use(time), status)
    }

    /// Snapshot which requests the full demand, used for placement of new VMs.
    pub fn demand_snapshot(&self) -> VmSnapshot {
        self.make_snapshot(self.demand, VmStatus::Pending)
    }

    fn make_snapshot(&self, resources_in_use: Resources, status: VmStatus) -> VmSnapshot {
        VmSnapshot {
            id: self.id,
            app_id: self.app_id,
            task_id: self.task_id,
            constraint: self.constraint,
            cores: self.cores,
            core_capacity: self.core_capacity,
            resources_in_use,
            status,
        }
    }
}

/// VM state as seen by management tiers: identity, constraint and resources in use.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VmSnapshot {
    pub id: u32,
    pub app_id: u32,
    pub task_id: u32,
    pub constraint: TaskConstraint,
    pub cores: u32,
    pub core_capacity: u32,
    pub resources_in_use: Resources,
    pub status: VmStatus,
}

impl VmSnapshot {
    pub fn is_same_task(&self, other: &VmSnapshot) -> bool {
        self.app_id == other.app_id && self.task_id == other.task_id
    }
}
