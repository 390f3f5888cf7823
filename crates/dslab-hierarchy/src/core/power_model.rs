//! Physical host power consumption models.

use dyn_clone::{clone_trait_object, DynClone};

use crate::core::config::{parse_config_value, parse_options, ConfigError};

/// Power model is a function, which computes the power consumption of a powered-on physical host
/// based on its current CPU load and simulation time.
pub trait PowerModel: DynClone {
    /// Returns the current power consumption of a physical host.
    ///
    /// - `time` - current simulation time.
    /// - `cpu_load` - current host CPU load.
    fn get_power(&self, time: f64, cpu_load: f64) -> f64;
}

clone_trait_object!(PowerModel);

/// Simple linear power model.
///
/// Computes host power consumption as `idle_power + cpu_load * (max_power - idle_power)`.
/// The consumption of a host which is not powered on is handled by the host itself.
#[derive(Clone)]
pub struct LinearPowerModel {
    max_power: f64,
    idle_power: f64,
}

impl LinearPowerModel {
    /// - `max_power` - host power when CPU is fully loaded.
    /// - `idle_power` - host power when CPU is idle.
    pub fn new(max_power: f64, idle_power: f64) -> Self {
        Self { max_power, idle_power }
    }
}

impl PowerModel for LinearPowerModel {
    fn get_power(&self, _time: f64, cpu_load: f64) -> f64 {
        self.idle_power + cpu_load * (self.max_power - self.idle_power)
    }
}

/// Power consumption does not depend on load.
#[derive(Clone)]
pub struct ConstantPowerModel {
    power: f64,
}

impl ConstantPowerModel {
    pub fn new(power: f64) -> Self {
        Self { power }
    }
}

impl PowerModel for ConstantPowerModel {
    fn get_power(&self, _time: f64, _cpu_load: f64) -> f64 {
        self.power
    }
}

fn parse_power_option(name: &str, options: &std::collections::HashMap<String, String>, key: &str) -> Result<f64, ConfigError> {
    let value = options.get(key).ok_or_else(|| ConfigError::InvalidPowerModel {
        value: name.to_string(),
        reason: format!("missing option {}", key),
    })?;
    let parsed = value.parse::<f64>().map_err(|_| ConfigError::InvalidPowerModel {
        value: name.to_string(),
        reason: format!("option {} is not a number", key),
    })?;
    if parsed <= 0. {
        return Err(ConfigError::InvalidPowerModel {
            value: name.to_string(),
            reason: format!("option {} must be positive", key),
        });
    }
    Ok(parsed)
}

/// Creates power model from string with model name and options, e.g. `Linear[max_power=250,idle_power=150]`.
pub fn power_model_resolver(config_str: &str) -> Result<Box<dyn PowerModel>, ConfigError> {
    let (model_name, options_str) = parse_config_value(config_str);
    let options = parse_options(&options_str.unwrap_or_default());
    match model_name.as_str() {
        "Linear" => {
            let max_power = parse_power_option(config_str, &options, "max_power")?;
            let idle_power = parse_power_option(config_str, &options, "idle_power")?;
            if idle_power > max_power {
                return Err(ConfigError::InvalidPowerModel {
                    value: config_str.to_string(),
                    reason: "idle_power exceeds max_power".to_string(),
                });
            }
            Ok(Box::new(LinearPowerModel::new(max_power, idle_power)))
        }
        "Constant" => {
            let power = parse_power_option(config_str, &options, "power")?;
            Ok(Box::new(ConstantPowerModel::new(power)))
        }
        _ => Err(ConfigError::InvalidPowerModel {
            value: config_str.to_string(),
            reason: "unknown model".to_string(),
        }),
    }
}
