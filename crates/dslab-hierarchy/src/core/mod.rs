pub mod app_pool;
pub mod application;
pub mod classifier;
pub mod cluster;
pub mod cluster_manager;
pub mod common;
pub mod config;
pub mod consolidation;
pub mod dc_manager;
pub mod energy_meter;
pub mod events;
pub mod host;
pub mod host_manager;
pub mod host_pool;
pub mod ledger;
pub mod load_model;
pub mod logger;
pub mod metrics;
pub mod migration_tracking;
pub mod ordering;
pub mod placement;
pub mod power_model;
pub mod rack;
pub mod rack_manager;
pub mod relocation;
pub mod status_store;
pub mod vm;
pub mod vm_registry;
