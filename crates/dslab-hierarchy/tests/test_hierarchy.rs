use dslab_core::simulation::Simulation;

use dslab_hierarchy::core::application::{ApplicationSpec, TaskSpec};
use dslab_hierarchy::core::classifier::StressPolicy;
use dslab_hierarchy::core::common::Resources;
use dslab_hierarchy::core::config::SimulationConfig;
use dslab_hierarchy::core::host::{HostDescription, PowerState};
use dslab_hierarchy::core::load_model::{ConstLoadModel, LoadModel, StepLoadModel};
use dslab_hierarchy::core::logger::{Decision, FileLogger, LogEntry};
use dslab_hierarchy::core::metrics::Metrics;
use dslab_hierarchy::core::power_model::LinearPowerModel;
use dslab_hierarchy::core::vm::TaskConstraint;
use dslab_hierarchy::simulation::HierarchicalSimulation;

// All hosts have 4 cores of 2500 MIPS, i.e. 10000 CPU shares, and the default thresholds are used:
// stressed at 0.9, underutilized below 0.6, target utilization 0.85 (8500 shares).
fn host_model() -> HostDescription {
    HostDescription::new(4, 2500, 16384, 102400, 102400, Box::new(LinearPowerModel::new(250., 150.)))
}

fn task_with_load(cores: u32, cpu: f64, constraint: TaskConstraint, load_model: Box<dyn LoadModel>) -> TaskSpec {
    TaskSpec::new(1, cores, 2500, Resources::new(cpu, 1024, 100, 100), constraint, load_model)
}

fn task(cores: u32, cpu: f64) -> TaskSpec {
    task_with_load(cores, cpu, TaskConstraint::Independent, Box::new(ConstLoadModel::new(1.)))
}

fn new_simulation(config: SimulationConfig) -> HierarchicalSimulation {
    let _ = env_logger::builder().is_test(true).try_init();
    HierarchicalSimulation::new(Simulation::new(123), config)
}

fn assert_protocol_state_is_clean(cloud_sim: &HierarchicalSimulation) {
    for rack_id in cloud_sim.rack_ids() {
        let rack = cloud_sim.rack(rack_id);
        assert!(rack.borrow().tracking().is_empty());
        assert!(rack.borrow().ledger().is_empty());
    }
    for cluster_id in cloud_sim.cluster_ids() {
        let cluster = cloud_sim.cluster(cluster_id);
        assert!(cluster.borrow().relocation_ledger().is_empty());
        assert!(cluster.borrow().placement_ledger().is_empty());
    }
    assert!(cloud_sim.dc().borrow().relocation_ledger().is_empty());
    assert!(cloud_sim.dc().borrow().placement_ledger().is_empty());
}

#[test]
// Host at 0.95 with VMs of 6000, 2500 and 1000 shares has excess 1000 over the target,
// the smallest VM relieving it is moved to the idle host of the same rack.
fn test_stressed_host_relieved_inside_rack() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(1, 2, host_model());
    let rack_id = cloud_sim.rack_ids()[0];
    let hosts = cloud_sim.hosts_of_rack(rack_id);

    let spec = ApplicationSpec::new()
        .with_task(task(3, 6000.))
        .with_task(task(1, 2500.))
        .with_task(task(1, 1000.));
    let app_id = cloud_sim.deploy_app(&spec, &[hosts[0], hosts[0], hosts[0]]);
    let vm_ids = cloud_sim.registry().borrow().get_app(app_id).vm_ids();

    cloud_sim.step_for_duration(10.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.internal_relocations, 1);
    assert_eq!(metrics.external_relocations, 0);
    assert_eq!(metrics.migrations_issued, 1);
    assert_eq!(metrics.migrations_completed, 1);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_ids[2]), Some(hosts[1]));
    assert_eq!(cloud_sim.host(hosts[0]).borrow().vms().len(), 2);
    assert!(cloud_sim.host(hosts[1]).borrow().vms().contains(&vm_ids[2]));
    assert_eq!(cloud_sim.host(hosts[1]).borrow().state(), PowerState::On);
    assert_protocol_state_is_clean(&cloud_sim);
}

fn overloaded_host_spec() -> ApplicationSpec {
    ApplicationSpec::new()
        .with_task(task(3, 6000.))
        .with_task(task(1, 2500.))
        .with_task(task(1, 1000.))
}

#[test]
// Window of one sample is not enough, the host is relieved after its second report.
fn test_stress_confirmed_by_two_samples() {
    let mut config = SimulationConfig::new();
    config.stress_policy = StressPolicy::LastTwoSamplesAboveUpper;
    let mut cloud_sim = new_simulation(config);
    cloud_sim.add_cluster(1, 2, host_model());
    let rack_id = cloud_sim.rack_ids()[0];
    let hosts = cloud_sim.hosts_of_rack(rack_id);

    let app_id = cloud_sim.deploy_app(&overloaded_host_spec(), &[hosts[0], hosts[0], hosts[0]]);
    let vm_ids = cloud_sim.registry().borrow().get_app(app_id).vm_ids();

    cloud_sim.step_for_duration(100.);
    assert_eq!(cloud_sim.metrics().internal_relocations, 0);
    assert_eq!(cloud_sim.metrics().migrations_issued, 0);
    assert_eq!(cloud_sim.host(hosts[0]).borrow().vms().len(), 3);

    cloud_sim.step_for_duration(30.);
    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.internal_relocations, 1);
    assert_eq!(metrics.migrations_completed, 1);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_ids[2]), Some(hosts[1]));
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// Repeated checks while the host waits for the cluster do not issue another request.
fn test_repeated_stress_check_keeps_single_request() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(1, 1, host_model());
    let rack_id = cloud_sim.rack_ids()[0];
    let host_id = cloud_sim.host_ids()[0];
    cloud_sim.deploy_app(&overloaded_host_spec(), &[host_id, host_id, host_id]);

    // the request leaves the rack at 0.2 and the rejection is back at 1.0
    cloud_sim.step_for_duration(0.5);
    assert_eq!(cloud_sim.rack(rack_id).borrow().ledger().len(), 1);
    cloud_sim.stress_check(host_id);
    cloud_sim.stress_check(host_id);
    cloud_sim.step_for_duration(0.1);
    assert_eq!(cloud_sim.rack(rack_id).borrow().ledger().len(), 1);

    cloud_sim.step_for_duration(10.);
    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.relocation_rejections, 1);
    assert_eq!(metrics.external_relocations, 0);
    assert_eq!(metrics.migrations_issued, 0);
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// Decisions and counters of a run are exported and read back.
fn test_decision_log_and_metrics_export() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cloud_sim =
        HierarchicalSimulation::with_logger(Simulation::new(123), SimulationConfig::new(), Box::new(FileLogger::new()));
    cloud_sim.add_cluster(1, 2, host_model());
    let hosts = cloud_sim.host_ids();
    cloud_sim.deploy_app(&overloaded_host_spec(), &[hosts[0], hosts[0], hosts[0]]);

    cloud_sim.step_for_duration(10.);

    let log_path = std::env::temp_dir().join("dslab_hierarchy_decisions.csv");
    let log_path = log_path.to_str().unwrap();
    cloud_sim.logger().borrow().save_log(log_path).unwrap();
    let mut rdr = csv::Reader::from_path(log_path).unwrap();
    let entries: Vec<LogEntry> = rdr.deserialize().map(|e| e.unwrap()).collect();
    std::fs::remove_file(log_path).unwrap();
    let count = |decision: Decision| entries.iter().filter(|e| e.decision == decision).count();
    assert_eq!(entries.len(), 1);
    assert_eq!(count(Decision::InternalRelocation), 1);
    assert_eq!(count(Decision::ExternalRelocation), 0);
    assert!(!entries[0].component.is_empty());
    assert!(entries[0].timestamp < 1.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.internal_relocations, 1);
    assert_eq!(metrics.migrations_completed, 1);
    let json_path = std::env::temp_dir().join("dslab_hierarchy_metrics.json");
    let json_path = json_path.to_str().unwrap();
    metrics.save_to_json(json_path).unwrap();
    let loaded: Metrics = serde_json::from_reader(std::fs::File::open(json_path).unwrap()).unwrap();
    std::fs::remove_file(json_path).unwrap();
    assert_eq!(loaded, metrics);
}

#[test]
// The only host of the data centre is stressed: the request climbs to the root and is rejected.
fn test_relocation_rejected_at_root() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(1, 1, host_model());
    let host_id = cloud_sim.host_ids()[0];

    let spec = ApplicationSpec::new()
        .with_task(task(3, 6000.))
        .with_task(task(1, 2500.))
        .with_task(task(1, 1000.));
    let app_id = cloud_sim.deploy_app(&spec, &[host_id, host_id, host_id]);

    cloud_sim.step_for_duration(10.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.relocation_rejections, 1);
    assert_eq!(metrics.internal_relocations, 0);
    assert_eq!(metrics.external_relocations, 0);
    assert_eq!(metrics.migrations_issued, 0);
    for vm_id in cloud_sim.registry().borrow().get_app(app_id).vm_ids() {
        assert_eq!(cloud_sim.registry().borrow().vm_location(vm_id), Some(host_id));
    }
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// Single-VM applications are evicted as a whole to another rack of the cluster.
fn test_application_moved_to_sibling_rack() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(2, 1, host_model());
    let racks = cloud_sim.rack_ids();
    let source = cloud_sim.hosts_of_rack(racks[0])[0];
    let target = cloud_sim.hosts_of_rack(racks[1])[0];

    let big = cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(3, 6000.)), &[source]);
    cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(1, 2500.)), &[source]);
    cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(1, 1000.)), &[source]);
    let vm_id = cloud_sim.registry().borrow().get_app(big).vm_ids()[0];

    cloud_sim.step_for_duration(10.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.internal_relocations, 0);
    assert_eq!(metrics.external_relocations, 1);
    assert_eq!(metrics.migrations_completed, 1);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_id), Some(target));

    let source_rack = cloud_sim.rack(racks[0]);
    let target_rack = cloud_sim.rack(racks[1]);
    assert!(source_rack.borrow().app_pool().get(big).is_none());
    assert!(!source_rack.borrow().vm_pool().contains(&vm_id));
    assert!(target_rack.borrow().app_pool().get(big).is_some());
    assert!(!target_rack.borrow().app_pool().is_surrogate(big));
    assert!(target_rack.borrow().vm_pool().contains(&vm_id));
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// Reply of the other cluster travels back through the data centre and the origin cluster.
fn test_relocation_escalated_to_other_cluster() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    let first = cloud_sim.add_cluster(1, 1, host_model());
    cloud_sim.add_cluster(1, 1, host_model());
    let source = cloud_sim.host_ids()[0];
    let target = cloud_sim.host_ids()[1];
    assert_eq!(cloud_sim.rack_of_host(source), cloud_sim.cluster(first).borrow().racks().keys().next().copied());

    let app_id = cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(3, 6000.)), &[source]);
    cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(2, 3500.)), &[source]);
    let vm_id = cloud_sim.registry().borrow().get_app(app_id).vm_ids()[0];

    cloud_sim.step_for_duration(10.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.external_relocations, 1);
    assert_eq!(metrics.relocation_rejections, 0);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_id), Some(target));
    assert_eq!(cloud_sim.host(target).borrow().state(), PowerState::On);
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// A VM of a two-VM application is evicted alone, then returns once its first host has room.
fn test_broken_application_repaired() {
    let mut config = SimulationConfig::new();
    config.repair_period = 1000.;
    let mut cloud_sim = new_simulation(config);
    cloud_sim.add_cluster(2, 1, host_model());
    let racks = cloud_sim.rack_ids();
    let master_host = cloud_sim.hosts_of_rack(racks[0])[0];
    let holder_host = cloud_sim.hosts_of_rack(racks[1])[0];

    // 2000 + 7500 shares until the second VM drops to 30% of its demand at t=500
    let spec = ApplicationSpec::new().with_task(task(1, 2000.)).with_task(task_with_load(
        3,
        7500.,
        TaskConstraint::Independent,
        Box::new(StepLoadModel::new(vec![(0., 1.), (500., 0.3)])),
    ));
    let app_id = cloud_sim.deploy_app(&spec, &[master_host, master_host]);
    let vm_ids = cloud_sim.registry().borrow().get_app(app_id).vm_ids();
    let master = cloud_sim.rack(racks[0]);
    let holder = cloud_sim.rack(racks[1]);

    cloud_sim.step_for_duration(10.);
    assert_eq!(cloud_sim.metrics().external_relocations, 1);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_ids[0]), Some(holder_host));
    assert!(master.borrow().app_pool().is_broken(app_id));
    assert_eq!(master.borrow().app_pool().holders(app_id).len(), 1);
    assert!(holder.borrow().app_pool().is_surrogate(app_id));

    cloud_sim.step_for_duration(1090.);
    assert_eq!(cloud_sim.metrics().repair_migrations, 1);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_ids[0]), Some(master_host));
    assert!(!master.borrow().app_pool().is_broken(app_id));
    assert!(master.borrow().vm_pool().contains(&vm_ids[0]));
    assert!(holder.borrow().app_pool().get(app_id).is_none());
    assert!(!holder.borrow().vm_pool().contains(&vm_ids[0]));
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// Anti-affinity instances land on distinct powered-off hosts, which are switched on.
fn test_placement_powers_hosts_on() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(1, 3, host_model());
    let hosts = cloud_sim.host_ids();
    for host_id in hosts.iter() {
        assert_eq!(cloud_sim.host(*host_id).borrow().state(), PowerState::Off);
    }

    let spec = ApplicationSpec::new().with_task(TaskSpec::new(
        2,
        2,
        2500,
        Resources::new(4000., 2048, 100, 100),
        TaskConstraint::AntiAffinity,
        Box::new(ConstLoadModel::new(1.)),
    ));
    let app_id = cloud_sim.spawn_app(&spec);

    cloud_sim.step_for_duration(10.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.placements, 1);
    assert_eq!(metrics.placement_failures, 0);
    assert_eq!(metrics.instantiations, 2);
    let registry = cloud_sim.registry();
    let locations: Vec<u32> = registry
        .borrow()
        .get_app(app_id)
        .vm_ids()
        .iter()
        .filter_map(|vm_id| registry.borrow().vm_location(*vm_id))
        .collect();
    assert_eq!(locations.len(), 2);
    assert_ne!(locations[0], locations[1]);
    for host_id in locations {
        assert_eq!(cloud_sim.host(host_id).borrow().state(), PowerState::On);
    }
    let powered_on = hosts
        .iter()
        .filter(|h| cloud_sim.host(**h).borrow().state() == PowerState::On)
        .count();
    assert_eq!(powered_on, 2);
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// No host model has enough cores, the failure is recorded at the data centre.
fn test_placement_failure_recorded_at_root() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(1, 2, host_model());

    let spec = ApplicationSpec::new().with_task(TaskSpec::new(
        1,
        16,
        2500,
        Resources::new(8000., 2048, 100, 100),
        TaskConstraint::Independent,
        Box::new(ConstLoadModel::new(1.)),
    ));
    cloud_sim.spawn_app(&spec);

    cloud_sim.step_for_duration(10.);

    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.placements, 0);
    assert_eq!(metrics.placement_failures, 1);
    assert_eq!(metrics.instantiations, 0);
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
// Host at 0.2 is drained into the host at 0.5 and switched off once its VM has left.
fn test_consolidation_shuts_drained_host_down() {
    let mut config = SimulationConfig::new();
    config.consolidation_interval = 600.;
    let mut cloud_sim = new_simulation(config);
    cloud_sim.add_cluster(1, 3, host_model());
    let hosts = cloud_sim.host_ids();

    let small = cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(1, 2000.)), &[hosts[0]]);
    cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(2, 5000.)), &[hosts[1]]);
    let vm_id = cloud_sim.registry().borrow().get_app(small).vm_ids()[0];

    cloud_sim.step_for_duration(590.);
    assert_eq!(cloud_sim.metrics().consolidation_migrations, 0);

    cloud_sim.step_for_duration(110.);
    let metrics = cloud_sim.metrics();
    assert_eq!(metrics.consolidation_migrations, 1);
    assert_eq!(metrics.migrations_completed, 1);
    assert_eq!(metrics.hosts_shut_down, 1);
    assert_eq!(cloud_sim.registry().borrow().vm_location(vm_id), Some(hosts[1]));
    assert_eq!(cloud_sim.host(hosts[0]).borrow().state(), PowerState::Off);
    assert_eq!(cloud_sim.host(hosts[1]).borrow().state(), PowerState::On);
    assert_eq!(cloud_sim.host(hosts[2]).borrow().state(), PowerState::Off);
    assert_protocol_state_is_clean(&cloud_sim);
}

#[test]
fn test_energy_is_consumed_by_powered_hosts_only() {
    let mut cloud_sim = new_simulation(SimulationConfig::new());
    cloud_sim.add_cluster(1, 2, host_model());
    let hosts = cloud_sim.host_ids();
    cloud_sim.deploy_app(&ApplicationSpec::new().with_task(task(2, 5000.)), &[hosts[0]]);

    cloud_sim.step_for_duration(100.);

    // linear model at 50% load: 150 + 0.5 * 100 watts
    let time = cloud_sim.current_time();
    let energy = cloud_sim.host(hosts[0]).borrow_mut().get_total_consumed(time);
    assert!((energy - 200. * time).abs() < 1e-6);
    assert_eq!(cloud_sim.host(hosts[1]).borrow_mut().get_total_consumed(time), 0.);
    assert!((cloud_sim.total_energy() - energy).abs() < 1e-6);
    assert!((cloud_sim.host(hosts[0]).borrow().get_uptime(time) - time).abs() < 1e-6);
    assert_eq!(cloud_sim.host(hosts[1]).borrow().get_uptime(time), 0.);
}

#[test]
fn test_topology_from_config_file() {
    let config = SimulationConfig::from_file("test-configs/config.yaml").unwrap();
    assert_eq!(config.number_of_hosts(), 12);
    assert_eq!(config.idle_host_state, PowerState::Suspended);

    let cloud_sim = HierarchicalSimulation::from_config(Simulation::new(123), config).unwrap();
    assert_eq!(cloud_sim.cluster_ids().len(), 2);
    assert_eq!(cloud_sim.rack_ids().len(), 4);
    assert_eq!(cloud_sim.host_ids().len(), 12);
    for rack_id in cloud_sim.rack_ids() {
        assert_eq!(cloud_sim.hosts_of_rack(rack_id).len(), 3);
        assert_eq!(cloud_sim.rack(rack_id).borrow().hosts().len(), 3);
    }
    assert_eq!(cloud_sim.dc().borrow().clusters().len(), 2);
}

#[test]
fn test_invalid_config_file_rejected() {
    assert!(SimulationConfig::from_file("test-configs/invalid_thresholds.yaml").is_err());
    assert!(SimulationConfig::from_file("test-configs/missing.yaml").is_err());
}
