//! Simulation configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::classifier::{Classifier, StressPolicy, Thresholds};
use crate::core::host::{HostDescription, PowerState};
use crate::core::ordering::{HostOrdering, HostSortKey, SortDirection, TargetOrder, VmOrdering, VmSortKey};
use crate::core::power_model::power_model_resolver;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("can't parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("thresholds must satisfy 0 < lower <= target <= upper <= 1, got lower={lower} target={target} upper={upper}")]
    InvalidThresholds { lower: f64, target: f64, upper: f64 },
    #[error("window size {size} is too small for stress policy {policy:?}")]
    InvalidWindow { size: usize, policy: StressPolicy },
    #[error("{name} must be positive")]
    NonPositive { name: String },
    #[error("ordering {name} has no sort keys")]
    EmptyOrdering { name: String },
    #[error("host state {state:?} can't be used as {name}")]
    InvalidHostState { name: String, state: PowerState },
    #[error("invalid topology: {reason}")]
    InvalidTopology { reason: String },
    #[error("invalid power model {value}: {reason}")]
    InvalidPowerModel { value: String, reason: String },
}

/// Host model of a cluster.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct HostModelConfig {
    pub cores: u32,
    pub core_capacity: u32,
    pub memory: u64,
    pub bandwidth: u64,
    pub storage: u64,
    /// power model string, e.g. `Linear[max_power=250,idle_power=150]`
    pub power_model: String,
}

impl HostModelConfig {
    pub fn to_description(&self) -> Result<HostDescription, ConfigError> {
        Ok(HostDescription::new(
            self.cores,
            self.core_capacity,
            self.memory,
            self.bandwidth,
            self.storage,
            power_model_resolver(&self.power_model)?,
        ))
    }
}

/// Represents cluster(s) configuration.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// number of such clusters
    pub count: Option<u32>,
    /// racks per cluster
    pub racks: u32,
    pub hosts_per_rack: u32,
    pub host: HostModelConfig,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
pub struct ConfigDataRaw {
    pub lower_threshold: Option<f64>,
    pub upper_threshold: Option<f64>,
    pub target_utilization: Option<f64>,
    pub window_size: Option<usize>,
    pub stress_policy: Option<StressPolicy>,
    pub host_status_period: Option<f64>,
    pub rack_status_period: Option<f64>,
    pub cluster_status_period: Option<f64>,
    pub consolidation_interval: Option<f64>,
    pub repair_period: Option<f64>,
    pub message_delay: Option<f64>,
    pub network_throughput: Option<f64>,
    pub vm_start_duration: Option<f64>,
    pub simulation_length: Option<f64>,
    pub idle_host_state: Option<PowerState>,
    pub initial_host_state: Option<PowerState>,
    pub target_order: Option<TargetOrder>,
    pub consolidation_source_order: Option<HostOrdering>,
    pub consolidation_target_order: Option<HostOrdering>,
    pub consolidation_vm_order: Option<VmOrdering>,
    pub clusters: Option<Vec<ClusterConfig>>,
}

/// Represents simulation configuration.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// hosts below this average utilization are underutilized
    pub lower_threshold: f64,
    /// hosts above this average utilization are stressed
    pub upper_threshold: f64,
    /// utilization ceiling for placement and migration targets
    pub target_utilization: f64,
    /// number of statuses kept in the history of each host, rack and cluster
    pub window_size: usize,
    pub stress_policy: StressPolicy,
    /// period of host status reports sent to the rack manager
    pub host_status_period: f64,
    /// period of rack status reports sent to the cluster manager
    pub rack_status_period: f64,
    /// period of cluster status reports sent to the data centre manager
    pub cluster_status_period: f64,
    pub consolidation_interval: f64,
    /// retry period of broken application repair
    pub repair_period: f64,
    /// message trip time between any two components
    pub message_delay: f64,
    /// memory units transferred per second, defines VM migration duration
    pub network_throughput: f64,
    /// vm initialization duration
    pub vm_start_duration: f64,
    /// periodic activities stop after this time, zero means never
    pub simulation_length: f64,
    /// state which hosts enter on shutdown
    pub idle_host_state: PowerState,
    /// state of hosts when the topology is built
    pub initial_host_state: PowerState,
    pub target_order: TargetOrder,
    pub consolidation_source_order: HostOrdering,
    pub consolidation_target_order: HostOrdering,
    pub consolidation_vm_order: VmOrdering,
    pub clusters: Vec<ClusterConfig>,
}

impl SimulationConfig {
    /// Creates simulation config with default parameter values.
    pub fn new() -> Self {
        Self {
            lower_threshold: 0.6,
            upper_threshold: 0.9,
            target_utilization: 0.85,
            window_size: 5,
            stress_policy: StressPolicy::AtLeastUpper,
            host_status_period: 120.,
            rack_status_period: 300.,
            cluster_status_period: 300.,
            consolidation_interval: 3600.,
            repair_period: 3600.,
            message_delay: 0.2,
            network_throughput: 1000.,
            vm_start_duration: 1.,
            simulation_length: 0.,
            idle_host_state: PowerState::Off,
            initial_host_state: PowerState::Off,
            target_order: TargetOrder::default(),
            consolidation_source_order: HostOrdering::new(
                SortDirection::Ascending,
                &[HostSortKey::PowerEfficiency, HostSortKey::CpuUtilization],
            ),
            consolidation_target_order: HostOrdering::new(
                SortDirection::Descending,
                &[HostSortKey::PowerEfficiency, HostSortKey::CpuUtilization],
            ),
            consolidation_vm_order: VmOrdering::new(
                SortDirection::Descending,
                &[
                    VmSortKey::Memory,
                    VmSortKey::Cores,
                    VmSortKey::CoreCapacity,
                    VmSortKey::CpuInUse,
                ],
            ),
            clusters: Vec::new(),
        }
    }

    /// Creates simulation config by reading parameter values from .yaml file (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(file_name).map_err(|source| ConfigError::Io {
            path: file_name.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates YAML config.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let data: ConfigDataRaw = serde_yaml::from_str(content)?;
        let default = SimulationConfig::new();
        let config = Self {
            lower_threshold: data.lower_threshold.unwrap_or(default.lower_threshold),
            upper_threshold: data.upper_threshold.unwrap_or(default.upper_threshold),
            target_utilization: data.target_utilization.unwrap_or(default.target_utilization),
            window_size: data.window_size.unwrap_or(default.window_size),
            stress_policy: data.stress_policy.unwrap_or(default.stress_policy),
            host_status_period: data.host_status_period.unwrap_or(default.host_status_period),
            rack_status_period: data.rack_status_period.unwrap_or(default.rack_status_period),
            cluster_status_period: data.cluster_status_period.unwrap_or(default.cluster_status_period),
            consolidation_interval: data.consolidation_interval.unwrap_or(default.consolidation_interval),
            repair_period: data.repair_period.unwrap_or(default.repair_period),
            message_delay: data.message_delay.unwrap_or(default.message_delay),
            network_throughput: data.network_throughput.unwrap_or(default.network_throughput),
            vm_start_duration: data.vm_start_duration.unwrap_or(default.vm_start_duration),
            simulation_length: data.simulation_length.unwrap_or(default.simulation_length),
            idle_host_state: data.idle_host_state.unwrap_or(default.idle_host_state),
            initial_host_state: data.initial_host_state.unwrap_or(default.initial_host_state),
            target_order: data.target_order.unwrap_or(default.target_order),
            consolidation_source_order: data
                .consolidation_source_order
                .unwrap_or(default.consolidation_source_order),
            consolidation_target_order: data
                .consolidation_target_order
                .unwrap_or(default.consolidation_target_order),
            consolidation_vm_order: data.consolidation_vm_order.unwrap_or(default.consolidation_vm_order),
            clusters: data.clusters.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks parameter values, returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (lower, target, upper) = (self.lower_threshold, self.target_utilization, self.upper_threshold);
        if !(0. < lower && lower <= target && target <= upper && upper <= 1.) {
            return Err(ConfigError::InvalidThresholds { lower, target, upper });
        }
        let min_window = match self.stress_policy {
            StressPolicy::LastTwoSamplesAboveUpper => 2,
            _ => 1,
        };
        if self.window_size < min_window {
            return Err(ConfigError::InvalidWindow {
                size: self.window_size,
                policy: self.stress_policy,
            });
        }
        for (name, value) in [
            ("host_status_period", self.host_status_period),
            ("rack_status_period", self.rack_status_period),
            ("cluster_status_period", self.cluster_status_period),
            ("consolidation_interval", self.consolidation_interval),
            ("repair_period", self.repair_period),
            ("network_throughput", self.network_throughput),
        ] {
            if value <= 0. {
                return Err(ConfigError::NonPositive { name: name.to_string() });
            }
        }
        if self.message_delay < 0. || self.vm_start_duration < 0. || self.simulation_length < 0. {
            return Err(ConfigError::NonPositive {
                name: "message_delay, vm_start_duration and simulation_length".to_string(),
            });
        }
        if self.idle_host_state == PowerState::On {
            return Err(ConfigError::InvalidHostState {
                name: "idle_host_state".to_string(),
                state: self.idle_host_state,
            });
        }
        for (name, empty) in [
            ("target_order.partially_utilized", self.target_order.partially_utilized.keys.is_empty()),
            ("target_order.underutilized", self.target_order.underutilized.keys.is_empty()),
            ("target_order.empty", self.target_order.empty.keys.is_empty()),
            ("consolidation_source_order", self.consolidation_source_order.keys.is_empty()),
            ("consolidation_target_order", self.consolidation_target_order.keys.is_empty()),
            ("consolidation_vm_order", self.consolidation_vm_order.keys.is_empty()),
        ] {
            if empty {
                return Err(ConfigError::EmptyOrdering { name: name.to_string() });
            }
        }
        for (i, cluster) in self.clusters.iter().enumerate() {
            if cluster.count == Some(0) || cluster.racks == 0 || cluster.hosts_per_rack == 0 {
                return Err(ConfigError::InvalidTopology {
                    reason: format!("cluster entry {} has zero count, racks or hosts", i),
                });
            }
            let host = &cluster.host;
            if host.cores == 0 || host.core_capacity == 0 || host.memory == 0 {
                return Err(ConfigError::InvalidTopology {
                    reason: format!("host model of cluster entry {} has zero capacity", i),
                });
            }
            power_model_resolver(&host.power_model)?;
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            lower: self.lower_threshold,
            upper: self.upper_threshold,
            target: self.target_utilization,
        }
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.thresholds(), self.stress_policy)
    }

    /// Whether periodic activities should still be rescheduled at the given time.
    pub fn is_running(&self, time: f64) -> bool {
        self.simulation_length == 0. || time < self.simulation_length
    }

    /// Returns total hosts count.
    pub fn number_of_hosts(&self) -> u32 {
        self.clusters
            .iter()
            .map(|c| c.count.unwrap_or(1) * c.racks * c.hosts_per_rack)
            .sum()
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses config value string, which consists of two parts - name and options.
/// Example: Linear[max_power=250,idle_power=150] parts are name Linear and options string "max_power=250,idle_power=150".
pub fn parse_config_value(config_str: &str) -> (String, Option<String>) {
    match config_str.split_once('[') {
        Some((l, r)) => (l.trim().to_string(), Some(r.replace(']', ""))),
        None => (config_str.trim().to_string(), None),
    }
}

/// Parses options string from config value, returns map with option names and values.
pub fn parse_options(options_str: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();
    for option_str in options_str.split(',') {
        if let Some((name, value)) = option_str.split_once('=') {
            options.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    options
}
