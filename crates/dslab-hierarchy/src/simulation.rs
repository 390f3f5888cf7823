//! Simulation facade: builds the data centre hierarchy and drives the simulation.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use sugars::{rc, refcell};

use dslab_core::context::SimulationContext;
use dslab_core::simulation::Simulation;

use crate::core::application::ApplicationSpec;
use crate::core::cluster::ClusterDescription;
use crate::core::cluster_manager::{ClusterManager, SendClusterStatus};
use crate::core::config::{ConfigError, SimulationConfig};
use crate::core::dc_manager::DcManager;
use crate::core::events::placement::PlacementRequest;
use crate::core::events::relocation::StressCheck;
use crate::core::host::HostDescription;
use crate::core::host_manager::{HostManager, SendHostStatus};
use crate::core::logger::{Logger, StdoutLogger};
use crate::core::metrics::Metrics;
use crate::core::rack::RackDescription;
use crate::core::rack_manager::{Consolidate, RackManager, SendRackStatus};
use crate::core::vm_registry::VmRegistry;

pub struct HierarchicalSimulation {
    dc: Rc<RefCell<DcManager>>,
    dc_id: u32,
    clusters: BTreeMap<u32, Rc<RefCell<ClusterManager>>>,
    racks: BTreeMap<u32, Rc<RefCell<RackManager>>>,
    hosts: BTreeMap<u32, Rc<RefCell<HostManager>>>,
    rack_of_host: BTreeMap<u32, u32>,
    registry: Rc<RefCell<VmRegistry>>,
    metrics: Rc<RefCell<Metrics>>,
    logger: Rc<RefCell<Box<dyn Logger>>>,
    sim: Simulation,
    ctx: SimulationContext,
    sim_config: Rc<SimulationConfig>,
}

impl HierarchicalSimulation {
    /// Creates simulation with an empty data centre, clusters are added with [`Self::add_cluster`].
    pub fn new(sim: Simulation, sim_config: SimulationConfig) -> Self {
        Self::with_logger(sim, sim_config, Box::new(StdoutLogger::new()))
    }

    pub fn with_logger(mut sim: Simulation, sim_config: SimulationConfig, logger: Box<dyn Logger>) -> Self {
        let sim_config = rc!(sim_config);
        let registry = rc!(refcell!(VmRegistry::new()));
        let metrics = rc!(refcell!(Metrics::new()));
        let logger = rc!(refcell!(logger));
        let dc = rc!(refcell!(DcManager::new(
            registry.clone(),
            metrics.clone(),
            logger.clone(),
            sim.create_context("dc"),
            sim_config.clone(),
        )));
        let dc_id = sim.add_handler("dc", dc.clone());
        let ctx = sim.create_context("simulation");
        Self {
            dc,
            dc_id,
            clusters: BTreeMap::new(),
            racks: BTreeMap::new(),
            hosts: BTreeMap::new(),
            rack_of_host: BTreeMap::new(),
            registry,
            metrics,
            logger,
            sim,
            ctx,
            sim_config,
        }
    }

    /// Creates simulation with the topology described by `clusters` of the config.
    pub fn from_config(sim: Simulation, sim_config: SimulationConfig) -> Result<Self, ConfigError> {
        sim_config.validate()?;
        let mut descriptions = Vec::new();
        for cluster in sim_config.clusters.iter() {
            let host = cluster.host.to_description()?;
            for _ in 0..cluster.count.unwrap_or(1) {
                descriptions.push((cluster.racks, cluster.hosts_per_rack, host.clone()));
            }
        }
        let mut simulation = Self::new(sim, sim_config);
        for (racks, hosts_per_rack, host) in descriptions {
            simulation.add_cluster(racks, hosts_per_rack, host);
        }
        Ok(simulation)
    }

    /// Adds cluster of identical racks and hosts, returns the cluster manager id.
    pub fn add_cluster(&mut self, racks: u32, hosts_per_rack: u32, host: HostDescription) -> u32 {
        let cluster_index = self.clusters.len();
        let cluster_name = format!("cluster-{}", cluster_index);
        let cluster = rc!(refcell!(ClusterManager::new(
            self.dc_id,
            self.registry.clone(),
            self.sim.create_context(&cluster_name),
            self.sim_config.clone(),
        )));
        let cluster_id = self.sim.add_handler(&cluster_name, cluster.clone());
        let state = self.sim_config.initial_host_state;
        let rack_description = RackDescription {
            host: host.clone(),
            host_count: hosts_per_rack,
        };

        for r in 0..racks {
            let rack_name = format!("rack-{}-{}", cluster_index, r);
            let rack = rc!(refcell!(RackManager::new(
                cluster_id,
                self.registry.clone(),
                self.metrics.clone(),
                self.logger.clone(),
                self.sim.create_context(&rack_name),
                self.sim_config.clone(),
            )));
            let rack_id = self.sim.add_handler(&rack_name, rack.clone());

            for h in 0..hosts_per_rack {
                let host_name = format!("host-{}-{}-{}", cluster_index, r, h);
                let host_manager = rc!(refcell!(HostManager::new(
                    host.clone(),
                    state,
                    rack_id,
                    self.registry.clone(),
                    self.metrics.clone(),
                    self.sim.create_context(&host_name),
                    self.sim_config.clone(),
                )));
                let host_id = self.sim.add_handler(&host_name, host_manager.clone());
                rack.borrow_mut().add_host(host_id, host.clone(), state);
                self.hosts.insert(host_id, host_manager);
                self.rack_of_host.insert(host_id, rack_id);
                // start sending host status to rack manager
                self.ctx.emit_now(SendHostStatus {}, host_id);
            }

            cluster
                .borrow_mut()
                .add_rack(rack_id, rack_description.clone(), state);
            self.racks.insert(rack_id, rack);
            self.ctx.emit_now(SendRackStatus {}, rack_id);
            self.ctx
                .emit(Consolidate {}, rack_id, self.sim_config.consolidation_interval);
        }

        self.dc.borrow_mut().add_cluster(
            cluster_id,
            ClusterDescription {
                rack: rack_description,
                rack_count: racks,
            },
        );
        self.clusters.insert(cluster_id, cluster);
        self.ctx.emit_now(SendClusterStatus {}, cluster_id);
        cluster_id
    }

    /// Submits application to the data centre manager, returns the application id.
    pub fn spawn_app(&mut self, spec: &ApplicationSpec) -> u32 {
        let app_id = self.registry.borrow_mut().register_app(spec);
        let sender = self.ctx.id();
        self.ctx.emit_now(PlacementRequest { app_id, sender }, self.dc_id);
        app_id
    }

    /// Starts application VMs right away on the given hosts, one host per VM in task order.
    ///
    /// All hosts must belong to the same rack, which becomes the owner of the application.
    pub fn deploy_app(&mut self, spec: &ApplicationSpec, hosts: &[u32]) -> u32 {
        let app_id = self.registry.borrow_mut().register_app(spec);
        let vm_ids = self.registry.borrow().get_app(app_id).vm_ids();
        assert_eq!(vm_ids.len(), hosts.len(), "each vm of app #{} needs a host", app_id);
        let rack_id = hosts.first().and_then(|host_id| self.rack_of_host(*host_id));
        for (vm_id, host_id) in vm_ids.iter().zip(hosts.iter()) {
            assert_eq!(
                self.rack_of_host(*host_id),
                rack_id,
                "hosts of app #{} belong to different racks",
                app_id
            );
            self.host(*host_id).borrow_mut().add_vm_now(*vm_id);
        }
        if let Some(rack_id) = rack_id {
            self.rack(rack_id).borrow_mut().add_deployed_app(app_id, &vm_ids);
        }
        app_id
    }

    /// Asks the rack manager to check the host right away.
    pub fn stress_check(&mut self, host_id: u32) {
        if let Some(rack_id) = self.rack_of_host(host_id) {
            self.ctx.emit_now(StressCheck { host_id }, rack_id);
        }
    }

    pub fn steps(&mut self, step_count: u64) -> bool {
        self.sim.steps(step_count)
    }

    pub fn step_for_duration(&mut self, time: f64) {
        self.sim.step_for_duration(time);
    }

    /// Runs until the event queue is empty, which requires a positive `simulation_length`.
    pub fn step_until_no_events(&mut self) {
        self.sim.step_until_no_events();
    }

    pub fn event_count(&self) -> u64 {
        self.sim.event_count()
    }

    pub fn current_time(&self) -> f64 {
        self.sim.time()
    }

    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn sim_config(&self) -> Rc<SimulationConfig> {
        self.sim_config.clone()
    }

    pub fn dc(&self) -> Rc<RefCell<DcManager>> {
        self.dc.clone()
    }

    pub fn dc_id(&self) -> u32 {
        self.dc_id
    }

    pub fn cluster(&self, cluster_id: u32) -> Rc<RefCell<ClusterManager>> {
        self.clusters
            .get(&cluster_id)
            .unwrap_or_else(|| panic!("unknown cluster #{}", cluster_id))
            .clone()
    }

    pub fn rack(&self, rack_id: u32) -> Rc<RefCell<RackManager>> {
        self.racks
            .get(&rack_id)
            .unwrap_or_else(|| panic!("unknown rack #{}", rack_id))
            .clone()
    }

    pub fn host(&self, host_id: u32) -> Rc<RefCell<HostManager>> {
        self.hosts
            .get(&host_id)
            .unwrap_or_else(|| panic!("unknown host #{}", host_id))
            .clone()
    }

    pub fn cluster_ids(&self) -> Vec<u32> {
        self.clusters.keys().copied().collect()
    }

    pub fn rack_ids(&self) -> Vec<u32> {
        self.racks.keys().copied().collect()
    }

    pub fn host_ids(&self) -> Vec<u32> {
        self.hosts.keys().copied().collect()
    }

    pub fn rack_of_host(&self, host_id: u32) -> Option<u32> {
        self.rack_of_host.get(&host_id).copied()
    }

    /// Hosts of the rack in creation order.
    pub fn hosts_of_rack(&self, rack_id: u32) -> Vec<u32> {
        self.rack_of_host
            .iter()
            .filter(|(_, r)| **r == rack_id)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.borrow().clone()
    }

    pub fn registry(&self) -> Rc<RefCell<VmRegistry>> {
        self.registry.clone()
    }

    pub fn logger(&self) -> Rc<RefCell<Box<dyn Logger>>> {
        self.logger.clone()
    }

    /// Energy consumed by all hosts until now.
    pub fn total_energy(&self) -> f64 {
        let time = self.sim.time();
        self.hosts
            .values()
            .map(|host| host.borrow_mut().get_total_consumed(time))
            .sum()
    }
}
