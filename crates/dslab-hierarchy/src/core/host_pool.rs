//! Host records kept by a rack manager.

use indexmap::IndexMap;

use crate::core::classifier::average_utilization;
use crate::core::common::round_utilization;
use crate::core::host::{HostDescription, HostStatus, PowerState};
use crate::core::status_store::StatusStore;

/// Everything a rack manager knows about one of its hosts.
#[derive(Clone)]
pub struct HostRecord {
    pub id: u32,
    pub description: HostDescription,
    pub store: StatusStore<HostStatus>,
}

impl HostRecord {
    /// CPU utilization of the sandbox status.
    pub fn utilization(&self) -> f64 {
        round_utilization(self.store.sandbox().cpu_utilization(&self.description.capacity))
    }

    /// Average CPU utilization over the reported history, ignoring sandbox changes.
    pub fn average_utilization(&self) -> f64 {
        let capacity = self.description.capacity.cpu;
        average_utilization(self.store.history(), |_| capacity)
    }

    pub fn power_efficiency(&self) -> f64 {
        self.description.power_efficiency()
    }

    pub fn power_state(&self) -> PowerState {
        self.store.sandbox().state
    }
}

/// Hosts of a single rack, iterated in insertion order.
#[derive(Clone, Default)]
pub struct HostPool {
    hosts: IndexMap<u32, HostRecord>,
}

impl HostPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, id: u32, description: HostDescription, state: PowerState, window: usize) {
        let store = StatusStore::new(HostStatus::new(id, state, 0.), window);
        self.hosts.insert(id, HostRecord { id, description, store });
    }

    pub fn contains(&self, id: u32) -> bool {
        self.hosts.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&HostRecord> {
        self.hosts.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut HostRecord> {
        self.hosts.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.hosts.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Stores a status received from the host. Returns false for unknown hosts.
    pub fn record(&mut self, status: HostStatus) -> bool {
        match self.hosts.get_mut(&status.host_id) {
            Some(host) => {
                host.store.push(status);
                true
            }
            None => false,
        }
    }

    /// Starts a planning pass.
    pub fn reset_sandboxes(&mut self) {
        for host in self.hosts.values_mut() {
            host.store.reset_sandbox();
        }
    }

    pub fn invalidate(&mut self, id: u32, time: f64) {
        if let Some(host) = self.hosts.get_mut(&id) {
            host.store.invalidate(time);
        }
    }

    /// Moves VM between sandboxes of two hosts. Returns false if the VM is not on the source.
    pub fn migrate(&mut self, vm_id: u32, source: u32, target: u32) -> bool {
        let vm = match self.hosts.get_mut(&source).and_then(|h| h.store.sandbox_mut().migrate_out(vm_id)) {
            Some(vm) => vm,
            None => return false,
        };
        match self.hosts.get_mut(&target) {
            Some(host) => {
                host.store.sandbox_mut().instantiate(vm);
                true
            }
            None => {
                if let Some(host) = self.hosts.get_mut(&source) {
                    host.store.sandbox_mut().undo_migrate_out(vm);
                }
                false
            }
        }
    }

    /// Reverts [`HostPool::migrate`].
    pub fn unmigrate(&mut self, vm_id: u32, source: u32, target: u32) {
        let vm = self
            .hosts
            .get_mut(&target)
            .and_then(|h| h.store.sandbox_mut().withdraw(vm_id))
            .unwrap_or_else(|| panic!("vm #{} is not reserved on host #{}", vm_id, target));
        if let Some(host) = self.hosts.get_mut(&source) {
            host.store.sandbox_mut().undo_migrate_out(vm);
        }
    }
}
