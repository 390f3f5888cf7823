//! Applications owned by a rack manager, including broken ones split across racks.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq)]
pub enum AppRole {
    /// The rack owns the application. `surrogates` maps VMs living elsewhere to their holder racks.
    Master { surrogates: BTreeMap<u32, u32> },
    /// The rack holds some VMs of an application owned by `master`.
    Surrogate { master: u32, vms: BTreeSet<u32> },
}

#[derive(Clone, Debug, Default)]
pub struct AppPool {
    apps: BTreeMap<u32, AppRole>,
}

impl AppPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_master(&mut self, app_id: u32) {
        self.apps.insert(
            app_id,
            AppRole::Master {
                surrogates: BTreeMap::new(),
            },
        );
    }

    /// Records VM received on behalf of another rack.
    pub fn insert_surrogate(&mut self, app_id: u32, master: u32, vm_id: u32) {
        match self.apps.get_mut(&app_id) {
            Some(AppRole::Surrogate { vms, master: m }) => {
                *m = master;
                vms.insert(vm_id);
            }
            Some(AppRole::Master { .. }) => {}
            None => {
                self.apps.insert(
                    app_id,
                    AppRole::Surrogate {
                        master,
                        vms: BTreeSet::from([vm_id]),
                    },
                );
            }
        }
    }

    /// Records that a VM of an owned application went to `holder`. Returns true if the
    /// application has just become broken.
    pub fn add_surrogate(&mut self, app_id: u32, vm_id: u32, holder: u32) -> bool {
        match self.apps.get_mut(&app_id) {
            Some(AppRole::Master { surrogates }) => {
                let was_whole = surrogates.is_empty();
                surrogates.insert(vm_id, holder);
                was_whole
            }
            _ => false,
        }
    }

    /// A surrogate VM returned to the master rack.
    pub fn surrogate_returned(&mut self, app_id: u32, vm_id: u32) {
        if let Some(AppRole::Master { surrogates }) = self.apps.get_mut(&app_id) {
            surrogates.remove(&vm_id);
        }
    }

    /// Holder racks of the surrogate VMs of an owned application.
    pub fn holders(&self, app_id: u32) -> BTreeSet<u32> {
        match self.apps.get(&app_id) {
            Some(AppRole::Master { surrogates }) => surrogates.values().copied().collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn is_broken(&self, app_id: u32) -> bool {
        matches!(self.apps.get(&app_id), Some(AppRole::Master { surrogates }) if !surrogates.is_empty())
    }

    pub fn is_surrogate(&self, app_id: u32) -> bool {
        matches!(self.apps.get(&app_id), Some(AppRole::Surrogate { .. }))
    }

    /// VMs held for another rack.
    pub fn surrogate_vms(&self, app_id: u32) -> BTreeSet<u32> {
        match self.apps.get(&app_id) {
            Some(AppRole::Surrogate { vms, .. }) => vms.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Owner rack of an application held here.
    pub fn master_of(&self, app_id: u32) -> Option<u32> {
        match self.apps.get(&app_id) {
            Some(AppRole::Surrogate { master, .. }) => Some(*master),
            _ => None,
        }
    }

    pub fn set_master(&mut self, app_id: u32, new_master: u32) {
        if let Some(AppRole::Surrogate { master, .. }) = self.apps.get_mut(&app_id) {
            *master = new_master;
        }
    }

    /// Forgets VM which left the rack. Surrogate records without VMs are dropped.
    pub fn release_vm(&mut self, app_id: u32, vm_id: u32) {
        let drop_record = match self.apps.get_mut(&app_id) {
            Some(AppRole::Surrogate { vms, .. }) => {
                vms.remove(&vm_id);
                vms.is_empty()
            }
            _ => false,
        };
        if drop_record {
            self.apps.remove(&app_id);
        }
    }

    pub fn remove(&mut self, app_id: u32) -> Option<AppRole> {
        self.apps.remove(&app_id)
    }

    pub fn get(&self, app_id: u32) -> Option<&AppRole> {
        self.apps.get(&app_id)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
