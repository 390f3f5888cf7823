//! VMs committed to an in-flight migration.

use std::collections::BTreeSet;

#[derive(Clone, Debug, Default)]
pub struct MigrationTracking {
    vms: BTreeSet<u32>,
}

impl MigrationTracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks VM as migrating. Marking the same VM twice is a logic error.
    pub fn insert(&mut self, vm_id: u32) {
        assert!(self.vms.insert(vm_id), "vm #{} is already tracked as migrating", vm_id);
    }

    /// Returns false if the VM was not tracked.
    pub fn remove(&mut self, vm_id: u32) -> bool {
        self.vms.remove(&vm_id)
    }

    pub fn contains(&self, vm_id: u32) -> bool {
        self.vms.contains(&vm_id)
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u32> {
        self.vms.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "already tracked")]
    fn test_double_insert_panics() {
        let mut tracking = MigrationTracking::new();
        tracking.insert(3);
        tracking.insert(3);
    }

    #[test]
    fn test_remove() {
        let mut tracking = MigrationTracking::new();
        tracking.insert(3);
        assert!(tracking.contains(3));
        assert!(tracking.remove(3));
        assert!(!tracking.remove(3));
        assert!(tracking.is_empty());
    }
}
