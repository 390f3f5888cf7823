//! Logging facilities to record management decisions during simulation.

use std::fs::File;

use serde::{Deserialize, Serialize};

use dslab_core::context::SimulationContext;
use dslab_core::log_info;

/// Kind of a management decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Placement,
    PlacementFailure,
    InternalRelocation,
    ExternalRelocation,
    RelocationRejected,
    Consolidation,
    Shutdown,
    Repair,
}

pub trait Logger {
    fn log_decision(&mut self, ctx: &SimulationContext, decision: Decision, message: String);

    fn save_log(&self, path: &str) -> Result<(), std::io::Error>;
}

/// Passes decisions to the `log` facade.
#[derive(Default)]
pub struct StdoutLogger {}

impl StdoutLogger {
    pub fn new() -> Self {
        Self {}
    }
}

impl Logger for StdoutLogger {
    fn log_decision(&mut self, ctx: &SimulationContext, decision: Decision, message: String) {
        log_info!(ctx, format!("{:?}: {}", decision, message));
    }

    fn save_log(&self, _path: &str) -> Result<(), std::io::Error> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub component: String,
    pub decision: Decision,
    pub message: String,
}

/// Keeps decisions in memory and saves them as CSV.
#[derive(Default)]
pub struct FileLogger {
    log: Vec<LogEntry>,
}

impl FileLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn count(&self, decision: Decision) -> usize {
        self.log.iter().filter(|e| e.decision == decision).count()
    }
}

impl Logger for FileLogger {
    fn log_decision(&mut self, ctx: &SimulationContext, decision: Decision, message: String) {
        self.log.push(LogEntry {
            timestamp: ctx.time(),
            component: ctx.name().to_string(),
            decision,
            message,
        });
    }

    fn save_log(&self, path: &str) -> Result<(), std::io::Error> {
        let file = File::create(path)?;
        let mut wtr = csv::Writer::from_writer(file);
        for entry in &self.log {
            wtr.serialize(entry)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dslab_core::simulation::Simulation;

    #[test]
    fn test_decisions_are_counted_by_kind() {
        let mut sim = Simulation::new(123);
        let ctx = sim.create_context("rack");
        let mut logger = FileLogger::new();
        logger.log_decision(&ctx, Decision::Placement, "app 1".to_string());
        logger.log_decision(&ctx, Decision::Shutdown, "host #2".to_string());
        logger.log_decision(&ctx, Decision::Placement, "app 3".to_string());
        assert_eq!(logger.count(Decision::Placement), 2);
        assert_eq!(logger.count(Decision::Shutdown), 1);
        assert_eq!(logger.count(Decision::Repair), 0);
        assert_eq!(logger.entries()[1].component, "rack");
        assert_eq!(logger.entries()[1].message, "host #2");
    }

    #[test]
    fn test_saved_log_is_read_back() {
        let mut sim = Simulation::new(123);
        let ctx = sim.create_context("cluster");
        let mut logger = FileLogger::new();
        logger.log_decision(&ctx, Decision::ExternalRelocation, "vm 4 to rack 1".to_string());
        logger.log_decision(&ctx, Decision::RelocationRejected, "vm 5 stays in place".to_string());

        let path = std::env::temp_dir().join("dslab_hierarchy_log_unit.csv");
        let path = path.to_str().unwrap();
        logger.save_log(path).unwrap();
        let mut rdr = csv::Reader::from_path(path).unwrap();
        let entries: Vec<LogEntry> = rdr.deserialize().map(|e| e.unwrap()).collect();
        assert_eq!(entries, logger.entries());
        std::fs::remove_file(path).unwrap();
    }
}
