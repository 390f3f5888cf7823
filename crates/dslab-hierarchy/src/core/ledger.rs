//! Outstanding cross-scope requests awaiting accept or reject.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::core::vm::VmSnapshot;

/// Identity of a request subject: a single VM or a whole application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SubjectKey {
    Vm(u32),
    App(u32),
}

impl Display for SubjectKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SubjectKey::Vm(id) => write!(f, "vm #{}", id),
            SubjectKey::App(id) => write!(f, "app #{}", id),
        }
    }
}

/// What is being moved or placed, with the resources requested for each VM.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationSubject {
    pub key: SubjectKey,
    pub vms: Vec<VmSnapshot>,
}

impl MigrationSubject {
    pub fn app_id(&self) -> u32 {
        match self.key {
            SubjectKey::App(id) => id,
            SubjectKey::Vm(_) => self.vms[0].app_id,
        }
    }

    pub fn vm_ids(&self) -> Vec<u32> {
        self.vms.iter().map(|vm| vm.id).collect()
    }
}

#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub subject: MigrationSubject,
    /// Rack manager which started the request.
    pub origin: u32,
    /// Manager the reply must be sent to.
    pub sender: u32,
    pub timestamp: f64,
    /// Child scopes which already received this request.
    pub tried: BTreeSet<u32>,
    /// The request was passed to the parent scope.
    pub escalated: bool,
}

impl LedgerEntry {
    pub fn new(subject: MigrationSubject, origin: u32, sender: u32, timestamp: f64) -> Self {
        Self {
            subject,
            origin,
            sender,
            timestamp,
            tried: BTreeSet::new(),
            escalated: false,
        }
    }
}

/// At most one entry per subject. Replies referring to missing entries are fatal.
#[derive(Clone, Debug, Default)]
pub struct Ledger {
    entries: BTreeMap<SubjectKey, LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: LedgerEntry) {
        let key = entry.subject.key;
        let prev = self.entries.insert(key, entry);
        assert!(prev.is_none(), "duplicate ledger entry for {}", key);
    }

    /// Removes entry matching a reply.
    pub fn take(&mut self, key: SubjectKey) -> LedgerEntry {
        self.entries
            .remove(&key)
            .unwrap_or_else(|| panic!("no ledger entry for {}", key))
    }

    pub fn get(&self, key: SubjectKey) -> Option<&LedgerEntry> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: SubjectKey) -> &mut LedgerEntry {
        self.entries
            .get_mut(&key)
            .unwrap_or_else(|| panic!("no ledger entry for {}", key))
    }

    pub fn contains(&self, key: SubjectKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: SubjectKey) -> LedgerEntry {
        LedgerEntry::new(MigrationSubject { key, vms: Vec::new() }, 1, 1, 0.)
    }

    #[test]
    fn test_take_removes_entry() {
        let mut ledger = Ledger::new();
        ledger.insert(entry(SubjectKey::Vm(1)));
        ledger.insert(entry(SubjectKey::App(1)));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.take(SubjectKey::Vm(1)).origin, 1);
        assert!(!ledger.contains(SubjectKey::Vm(1)));
        assert!(ledger.contains(SubjectKey::App(1)));
    }

    #[test]
    #[should_panic(expected = "no ledger entry for vm #5")]
    fn test_reply_without_entry_panics() {
        Ledger::new().take(SubjectKey::Vm(5));
    }

    #[test]
    #[should_panic(expected = "duplicate ledger entry")]
    fn test_duplicate_entry_panics() {
        let mut ledger = Ledger::new();
        ledger.insert(entry(SubjectKey::App(2)));
        ledger.insert(entry(SubjectKey::App(2)));
    }
}
