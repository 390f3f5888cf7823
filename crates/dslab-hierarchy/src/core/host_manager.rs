use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use serde::Serialize;

use dslab_core::cast;
use dslab_core::context::SimulationContext;
use dslab_core::event::Event;
use dslab_core::handler::EventHandler;
use dslab_core::{log_debug, log_trace, log_warn};

use crate::core::config::SimulationConfig;
use crate::core::energy_meter::EnergyMeter;
use crate::core::events::actions::{
    InstantiateVm, MigrateVm, MigrationCompleted, MigrationFailed, MigrationFinished, MigrationStart, ReleaseMigratedVm,
    ShutdownHost, VmInstantiated, VmStarted,
};
use crate::core::events::status::HostStatusReport;
use crate::core::host::{HostDescription, HostStatus, PowerState};
use crate::core::metrics::Metrics;
use crate::core::vm::VmStatus;
use crate::core::vm_registry::VmRegistry;

/// Simulated physical host which executes actions issued by its rack manager.
pub struct HostManager {
    pub id: u32,
    description: HostDescription,
    state: PowerState,

    /// Running VMs, including the ones being migrated away.
    vms: BTreeSet<u32>,
    starting: BTreeSet<u32>,
    incoming: BTreeSet<u32>,
    outgoing: BTreeSet<u32>,

    energy_meter: EnergyMeter,
    rack_manager_id: u32,
    registry: Rc<RefCell<VmRegistry>>,
    metrics: Rc<RefCell<Metrics>>,

    ctx: SimulationContext,
    sim_config: Rc<SimulationConfig>,
}

impl HostManager {
    pub fn new(
        description: HostDescription,
        state: PowerState,
        rack_manager_id: u32,
        registry: Rc<RefCell<VmRegistry>>,
        metrics: Rc<RefCell<Metrics>>,
        ctx: SimulationContext,
        sim_config: Rc<SimulationConfig>,
    ) -> Self {
        Self {
            id: ctx.id(),
            description,
            state,
            vms: BTreeSet::new(),
            starting: BTreeSet::new(),
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            energy_meter: EnergyMeter::new(state),
            rack_manager_id,
            registry,
            metrics,
            ctx,
            sim_config,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn description(&self) -> &HostDescription {
        &self.description
    }

    pub fn rack_manager_id(&self) -> u32 {
        self.rack_manager_id
    }

    /// Running VMs.
    pub fn vms(&self) -> &BTreeSet<u32> {
        &self.vms
    }

    pub fn is_idle(&self) -> bool {
        self.vms.is_empty() && self.starting.is_empty() && self.incoming.is_empty() && self.outgoing.is_empty()
    }

    pub fn get_cpu_load(&self, time: f64) -> f64 {
        let registry = self.registry.borrow();
        let cpu_used: f64 = self
            .vms
            .iter()
            .map(|vm_id| registry.get_vm(*vm_id).resources_in_use(time).cpu)
            .sum();
        (cpu_used / self.description.capacity.cpu).min(1.)
    }

    pub fn get_power(&self, time: f64) -> f64 {
        match self.state {
            PowerState::On => self.description.power_model.get_power(time, self.get_cpu_load(time)),
            _ => 0.,
        }
    }

    pub fn get_total_consumed(&mut self, time: f64) -> f64 {
        self.energy_meter.record(time, self.get_power(time), self.state);
        self.energy_meter.energy_until(time)
    }

    /// Time spent powered on until `time`.
    pub fn get_uptime(&self, time: f64) -> f64 {
        self.energy_meter.time_in(PowerState::On, time)
    }

    fn update_energy(&mut self) {
        let time = self.ctx.time();
        self.energy_meter.record(time, self.get_power(time), self.state);
    }

    /// Status with resident, starting and incoming VMs.
    pub fn status(&self, time: f64) -> HostStatus {
        let registry = self.registry.borrow();
        let mut status = HostStatus::new(self.id, self.state, time);
        status.incoming_migrations = self.incoming.len() as u32;
        status.outgoing_migrations = self.outgoing.len() as u32;
        status.vms = self
            .vms
            .iter()
            .chain(self.starting.iter())
            .chain(self.incoming.iter())
            .map(|vm_id| registry.snapshot(*vm_id, time))
            .collect();
        status.power = self.get_power(time);
        status
    }

    fn power_on(&mut self) {
        if self.state != PowerState::On {
            self.update_energy();
            log_debug!(self.ctx, "host #{} powered on from {:?}", self.id, self.state);
            self.state = PowerState::On;
            self.update_energy();
        }
    }

    /// Starts VM immediately, used for the initial deployment.
    pub fn add_vm_now(&mut self, vm_id: u32) {
        self.power_on();
        let time = self.ctx.time();
        {
            let mut registry = self.registry.borrow_mut();
            registry.get_vm_mut(vm_id).set_start_time(time);
            registry.set_vm_status(vm_id, VmStatus::Running);
            registry.set_vm_location(vm_id, self.id);
        }
        self.vms.insert(vm_id);
        self.update_energy();
    }

    fn on_instantiate_vm(&mut self, vm_id: u32, manager: u32) {
        self.power_on();
        self.starting.insert(vm_id);
        {
            let mut registry = self.registry.borrow_mut();
            registry.set_vm_status(vm_id, VmStatus::Initializing);
            registry.set_vm_location(vm_id, self.id);
        }
        log_debug!(self.ctx, "vm #{} is starting on host #{}", vm_id, self.id);
        self.ctx
            .emit_self(VmStarted { vm_id, manager }, self.sim_config.vm_start_duration);
    }

    fn on_vm_started(&mut self, vm_id: u32, manager: u32) {
        if !self.starting.remove(&vm_id) {
            return;
        }
        let time = self.ctx.time();
        {
            let mut registry = self.registry.borrow_mut();
            registry.get_vm_mut(vm_id).set_start_time(time);
            registry.set_vm_status(vm_id, VmStatus::Running);
        }
        self.vms.insert(vm_id);
        self.update_energy();
        log_debug!(self.ctx, "vm #{} started and running", vm_id);
        self.ctx.emit(
            VmInstantiated { vm_id, host_id: self.id },
            manager,
            self.sim_config.message_delay,
        );
    }

    fn on_migrate_vm(&mut self, vm_id: u32, target_host: u32, manager: u32) {
        if !self.vms.contains(&vm_id) || self.outgoing.contains(&vm_id) {
            log_warn!(
                self.ctx,
                "vm #{} can't be migrated from host #{}: not running here",
                vm_id,
                self.id
            );
            self.ctx.emit(
                MigrationFailed {
                    vm_id,
                    source_host: self.id,
                    target_host,
                },
                manager,
                self.sim_config.message_delay,
            );
            return;
        }
        self.outgoing.insert(vm_id);
        self.registry.borrow_mut().set_vm_status(vm_id, VmStatus::Migrating);
        log_debug!(self.ctx, "vm #{} migrates from host #{} to host #{}", vm_id, self.id, target_host);
        self.ctx.emit(
            MigrationStart {
                vm_id,
                source_host: self.id,
                manager,
            },
            target_host,
            self.sim_config.message_delay,
        );
    }

    fn on_migration_start(&mut self, vm_id: u32, source_host: u32, manager: u32) {
        self.power_on();
        self.incoming.insert(vm_id);
        let memory = self.registry.borrow().get_vm(vm_id).demand.memory;
        let migration_duration = memory as f64 / self.sim_config.network_throughput;
        self.ctx.emit_self(
            MigrationFinished {
                vm_id,
                source_host,
                manager,
            },
            migration_duration,
        );
    }

    fn on_migration_finished(&mut self, vm_id: u32, source_host: u32, manager: u32) {
        self.incoming.remove(&vm_id);
        {
            let mut registry = self.registry.borrow_mut();
            registry.set_vm_status(vm_id, VmStatus::Running);
            registry.set_vm_location(vm_id, self.id);
        }
        self.vms.insert(vm_id);
        self.update_energy();
        log_debug!(self.ctx, "vm #{} migrated from host #{} to host #{}", vm_id, source_host, self.id);
        self.ctx
            .emit(ReleaseMigratedVm { vm_id }, source_host, self.sim_config.message_delay);
        self.ctx.emit(
            MigrationCompleted {
                vm_id,
                source_host,
                target_host: self.id,
            },
            manager,
            self.sim_config.message_delay,
        );
    }

    fn on_release_migrated_vm(&mut self, vm_id: u32) {
        self.outgoing.remove(&vm_id);
        if self.vms.remove(&vm_id) {
            self.update_energy();
            log_trace!(self.ctx, "vm #{} released on host #{}", vm_id, self.id);
        }
    }

    fn on_shutdown(&mut self) {
        if self.state != PowerState::On {
            return;
        }
        if !self.is_idle() {
            log_warn!(self.ctx, "host #{} is not idle, shutdown refused", self.id);
            return;
        }
        self.update_energy();
        self.state = self.sim_config.idle_host_state;
        self.update_energy();
        self.metrics.borrow_mut().hosts_shut_down += 1;
        log_debug!(self.ctx, "host #{} switched to {:?}", self.id, self.state);
    }

    fn send_status(&mut self) {
        log_trace!(self.ctx, "host #{} sends its status to rack manager", self.id);
        self.update_energy();
        let status = self.status(self.ctx.time());
        self.ctx.emit(
            HostStatusReport { status },
            self.rack_manager_id,
            self.sim_config.message_delay,
        );
        if self.sim_config.is_running(self.ctx.time()) {
            self.ctx
                .emit_self(SendHostStatus {}, self.sim_config.host_status_period);
        }
    }
}

#[derive(Serialize)]
pub struct SendHostStatus {}

impl EventHandler for HostManager {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            SendHostStatus {} => {
                self.send_status();
            }
            InstantiateVm { vm_id, manager } => {
                self.on_instantiate_vm(vm_id, manager);
            }
            VmStarted { vm_id, manager } => {
                self.on_vm_started(vm_id, manager);
            }
            MigrateVm {
                vm_id,
                target_host,
                manager,
            } => {
                self.on_migrate_vm(vm_id, target_host, manager);
            }
            MigrationStart {
                vm_id,
                source_host,
                manager,
            } => {
                self.on_migration_start(vm_id, source_host, manager);
            }
            MigrationFinished {
                vm_id,
                source_host,
                manager,
            } => {
                self.on_migration_finished(vm_id, source_host, manager);
            }
            ReleaseMigratedVm { vm_id } => {
                self.on_release_migrated_vm(vm_id);
            }
            ShutdownHost {} => {
                self.on_shutdown();
            }
        })
    }
}
