//! Applications composed of tasks with co-location constraints.

use crate::core::common::Resources;
use crate::core::load_model::LoadModel;
use crate::core::vm::TaskConstraint;

/// Task description submitted by a client.
#[derive(Clone)]
pub struct TaskSpec {
    pub instances: u32,
    pub cores: u32,
    pub core_capacity: u32,
    pub demand: Resources,
    pub constraint: TaskConstraint,
    pub load_model: Box<dyn LoadModel>,
}

impl TaskSpec {
    pub fn new(
        instances: u32,
        cores: u32,
        core_capacity: u32,
        demand: Resources,
        constraint: TaskConstraint,
        load_model: Box<dyn LoadModel>,
    ) -> Self {
        Self {
            instances,
            cores,
            core_capacity,
            demand,
            constraint,
            load_model,
        }
    }
}

/// Application description submitted by a client.
#[derive(Clone, Default)]
pub struct ApplicationSpec {
    pub tasks: Vec<TaskSpec>,
}

impl ApplicationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn vm_count(&self) -> usize {
        self.tasks.iter().map(|t| t.instances as usize).sum()
    }
}

#[derive(Clone, Debug)]
pub struct Task {
    pub id: u32,
    pub constraint: TaskConstraint,
    pub vm_ids: Vec<u32>,
}

/// Registered application with VM ids assigned to every task instance.
#[derive(Clone, Debug)]
pub struct Application {
    pub id: u32,
    pub tasks: Vec<Task>,
}

impl Application {
    pub fn vm_ids(&self) -> Vec<u32> {
        self.tasks.iter().flat_map(|t| t.vm_ids.iter().copied()).collect()
    }

    pub fn vm_count(&self) -> usize {
        self.tasks.iter().map(|t| t.vm_ids.len()).sum()
    }

    pub fn task(&self, task_id: u32) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// VMs which must share a host with the given affinity group.
    pub fn affinity_group_vms(&self, group: u32) -> Vec<u32> {
        self.tasks
            .iter()
            .filter(|t| t.constraint == TaskConstraint::Affinity { group })
            .flat_map(|t| t.vm_ids.iter().copied())
            .collect()
    }
}
