//! Decision counters shared by all managers.

use std::fs::File;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Applications placed by the placement protocol.
    pub placements: u64,
    /// Applications rejected at the data centre level.
    pub placement_failures: u64,
    pub internal_relocations: u64,
    pub external_relocations: u64,
    /// Relocation requests rejected at every level.
    pub relocation_rejections: u64,
    pub migrations_issued: u64,
    pub migrations_completed: u64,
    /// Migrations refused by the source host.
    pub migrations_failed: u64,
    pub consolidation_migrations: u64,
    pub hosts_shut_down: u64,
    pub repair_migrations: u64,
    pub instantiations: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn save_to_json(&self, path: &str) -> Result<(), std::io::Error> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
