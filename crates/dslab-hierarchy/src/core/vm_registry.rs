//! Registry of applications and VMs known to the simulation.

use std::collections::BTreeMap;

use crate::core::application::{Application, ApplicationSpec, Task};
use crate::core::vm::{VirtualMachine, VmSnapshot, VmStatus};

/// Stores static VM descriptions together with their current status and location.
///
/// Events carry only VM ids, components look up the rest here.
#[derive(Default)]
pub struct VmRegistry {
    vms: BTreeMap<u32, VirtualMachine>,
    vm_status: BTreeMap<u32, VmStatus>,
    vm_location: BTreeMap<u32, u32>,
    apps: BTreeMap<u32, Application>,
    next_vm_id: u32,
    next_app_id: u32,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers application and creates a VM for every task instance. Returns the application id.
    pub fn register_app(&mut self, spec: &ApplicationSpec) -> u32 {
        let app_id = self.next_app_id;
        self.next_app_id += 1;
        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for (task_id, task_spec) in spec.tasks.iter().enumerate() {
            let task_id = task_id as u32;
            let mut vm_ids = Vec::with_capacity(task_spec.instances as usize);
            for _ in 0..task_spec.instances {
                let vm_id = self.next_vm_id;
                self.next_vm_id += 1;
                let vm = VirtualMachine::new(
                    vm_id,
                    app_id,
                    task_id,
                    task_spec.constraint,
                    task_spec.cores,
                    task_spec.core_capacity,
                    task_spec.demand,
                    task_spec.load_model.clone(),
                );
                self.vms.insert(vm_id, vm);
                self.vm_status.insert(vm_id, VmStatus::Pending);
                vm_ids.push(vm_id);
            }
            tasks.push(Task {
                id: task_id,
                constraint: task_spec.constraint,
                vm_ids,
            });
        }
        self.apps.insert(app_id, Application { id: app_id, tasks });
        app_id
    }

    pub fn get_vm(&self, vm_id: u32) -> &VirtualMachine {
        self.vms
            .get(&vm_id)
            .unwrap_or_else(|| panic!("vm #{} is not registered", vm_id))
    }

    pub fn get_vm_mut(&mut self, vm_id: u32) -> &mut VirtualMachine {
        self.vms
            .get_mut(&vm_id)
            .unwrap_or_else(|| panic!("vm #{} is not registered", vm_id))
    }

    pub fn get_app(&self, app_id: u32) -> &Application {
        self.apps
            .get(&app_id)
            .unwrap_or_else(|| panic!("app #{} is not registered", app_id))
    }

    pub fn vm_status(&self, vm_id: u32) -> VmStatus {
        self.vm_status.get(&vm_id).copied().unwrap_or(VmStatus::Pending)
    }

    pub fn set_vm_status(&mut self, vm_id: u32, status: VmStatus) {
        self.vm_status.insert(vm_id, status);
    }

    /// Host currently running the VM, if any.
    pub fn vm_location(&self, vm_id: u32) -> Option<u32> {
        self.vm_location.get(&vm_id).copied()
    }

    pub fn set_vm_location(&mut self, vm_id: u32, host_id: u32) {
        self.vm_location.insert(vm_id, host_id);
    }

    pub fn snapshot(&self, vm_id: u32, time: f64) -> VmSnapshot {
        self.get_vm(vm_id).snapshot(time, self.vm_status(vm_id))
    }

    /// Snapshots with full demand of all application VMs, used to place a new application.
    pub fn app_demand(&self, app_id: u32) -> Vec<VmSnapshot> {
        self.get_app(app_id)
            .vm_ids()
            .into_iter()
            .map(|vm_id| self.get_vm(vm_id).demand_snapshot())
            .collect()
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }
}
