use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::Serialize;

use dslab_core::cast;
use dslab_core::context::SimulationContext;
use dslab_core::event::Event;
use dslab_core::handler::EventHandler;
use dslab_core::{log_debug, log_error, log_trace, log_warn};

use crate::core::app_pool::AppPool;
use crate::core::classifier::{average_utilization, Classification, Classifier, UtilizationClass};
use crate::core::config::SimulationConfig;
use crate::core::consolidation::{plan_consolidation, ConsolidationPolicy};
use crate::core::events::actions::{
    InstantiateVm, MigrateVm, MigrationCompleted, MigrationFailed, ShutdownHost, VmInstantiated,
};
use crate::core::events::placement::{PlacementAccept, PlacementReject, PlacementRequest};
use crate::core::events::relocation::{
    AppTransfer, IncomingMigration, IncomingMigrationCancelled, MigAccept, MigReject, MigRequest, StressCheck,
};
use crate::core::events::repair::{
    RepairBrokenApp, SurrogateAppData, SurrogateAppMigrate, SurrogateAppReject, SurrogateAppRequest,
};
use crate::core::events::status::{HostStatusReport, RackStatusReport};
use crate::core::host::{HostDescription, HostStatus, PowerState};
use crate::core::host_pool::HostPool;
use crate::core::ledger::{Ledger, LedgerEntry, MigrationSubject, SubjectKey};
use crate::core::logger::{Decision, Logger};
use crate::core::metrics::Metrics;
use crate::core::migration_tracking::MigrationTracking;
use crate::core::placement::{fits, place, rollback, Assignment, ConstraintGroups};
use crate::core::rack::RackStatus;
use crate::core::relocation::{order_source_vms, plan_internal, relocation_units, select_external_candidate};
use crate::core::vm::{TaskConstraint, VmSnapshot, VmStatus};
use crate::core::vm_registry::VmRegistry;

/// VM handed over to another rack while its migration is in flight.
#[derive(Clone, Copy, Debug)]
struct Handoff {
    app_id: u32,
    rack: u32,
    transfer: AppTransfer,
}

/// Manages hosts of a single rack: relieves stressed hosts, places applications, consolidates
/// underutilized hosts and repairs applications split across racks.
pub struct RackManager {
    pub id: u32,
    cluster_manager_id: u32,
    hosts: HostPool,
    classifier: Classifier,
    ledger: Ledger,
    tracking: MigrationTracking,
    app_pool: AppPool,
    /// VMs owned or held by this rack.
    vm_pool: BTreeSet<u32>,
    /// Consolidation sources waiting for their VMs to leave before shutdown.
    draining: BTreeMap<u32, BTreeSet<u32>>,
    handoffs: BTreeMap<u32, Handoff>,

    registry: Rc<RefCell<VmRegistry>>,
    metrics: Rc<RefCell<Metrics>>,
    logger: Rc<RefCell<Box<dyn Logger>>>,

    ctx: SimulationContext,
    sim_config: Rc<SimulationConfig>,
}

impl RackManager {
    pub fn new(
        cluster_manager_id: u32,
        registry: Rc<RefCell<VmRegistry>>,
        metrics: Rc<RefCell<Metrics>>,
        logger: Rc<RefCell<Box<dyn Logger>>>,
        ctx: SimulationContext,
        sim_config: Rc<SimulationConfig>,
    ) -> Self {
        Self {
            id: ctx.id(),
            cluster_manager_id,
            hosts: HostPool::new(),
            classifier: sim_config.classifier(),
            ledger: Ledger::new(),
            tracking: MigrationTracking::new(),
            app_pool: AppPool::new(),
            vm_pool: BTreeSet::new(),
            draining: BTreeMap::new(),
            handoffs: BTreeMap::new(),
            registry,
            metrics,
            logger,
            ctx,
            sim_config,
        }
    }

    pub fn add_host(&mut self, id: u32, description: HostDescription, state: PowerState) {
        self.hosts.add_host(id, description, state, self.sim_config.window_size);
    }

    /// Records an application deployed directly onto hosts of this rack.
    pub fn add_deployed_app(&mut self, app_id: u32, vm_ids: &[u32]) {
        self.app_pool.insert_master(app_id);
        self.vm_pool.extend(vm_ids.iter().copied());
    }

    pub fn cluster_manager_id(&self) -> u32 {
        self.cluster_manager_id
    }

    pub fn hosts(&self) -> &HostPool {
        &self.hosts
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn tracking(&self) -> &MigrationTracking {
        &self.tracking
    }

    pub fn app_pool(&self) -> &AppPool {
        &self.app_pool
    }

    pub fn vm_pool(&self) -> &BTreeSet<u32> {
        &self.vm_pool
    }

    fn log_decision(&self, decision: Decision, message: String) {
        self.logger.borrow_mut().log_decision(&self.ctx, decision, message);
    }

    fn host_class(&self, host_id: u32) -> Option<UtilizationClass> {
        let host = self.hosts.get(host_id)?;
        let capacity = host.description.capacity.cpu;
        self.classifier.classify(&host.store, |_| capacity)
    }

    /// Resets sandboxes and returns the classification with the ordered target list.
    fn start_planning(&mut self) -> (Classification, Vec<u32>) {
        self.hosts.reset_sandboxes();
        let classification = self.classifier.classify_hosts(&self.hosts);
        let targets = self.sim_config.target_order.build(&classification, &self.hosts);
        (classification, targets)
    }

    fn migrate_vm(&mut self, vm_id: u32, source: u32, target: u32) {
        self.ctx.emit(
            MigrateVm {
                vm_id,
                target_host: target,
                manager: self.id,
            },
            source,
            self.sim_config.message_delay,
        );
        self.metrics.borrow_mut().migrations_issued += 1;
    }

    fn on_host_status(&mut self, status: HostStatus) {
        let host_id = status.host_id;
        if !self.hosts.record(status) {
            log_warn!(self.ctx, "status of unknown host #{}", host_id);
            return;
        }
        if self.host_class(host_id) == Some(UtilizationClass::Stressed) {
            self.ctx.emit_self(StressCheck { host_id }, 0.);
        }
    }

    /// Relieves a stressed host with a single migration inside the rack, or asks the cluster
    /// to take one VM or application.
    fn on_stress_check(&mut self, host_id: u32) {
        if self.host_class(host_id) != Some(UtilizationClass::Stressed) {
            return;
        }
        let (capacity, average) = match self.hosts.get(host_id) {
            Some(host) => {
                let current = host.store.current();
                if current.outgoing_migrations > 0 {
                    return;
                }
                let registry = self.registry.borrow();
                if current
                    .vms
                    .iter()
                    .any(|vm| self.tracking.contains(vm.id) || registry.vm_status(vm.id) == VmStatus::Migrating)
                {
                    return;
                }
                let capacity = host.description.capacity.cpu;
                (capacity, average_utilization(host.store.history(), |_| capacity))
            }
            None => return,
        };

        let now = self.ctx.time();
        let target = self.sim_config.target_utilization;
        let (_, targets) = self.start_planning();
        let candidates: Vec<VmSnapshot> = match self.hosts.get(host_id) {
            Some(host) => host
                .store
                .sandbox()
                .vms
                .iter()
                .filter(|vm| {
                    vm.status == VmStatus::Running && self.vm_pool.contains(&vm.id) && !self.tracking.contains(vm.id)
                })
                .cloned()
                .collect(),
            None => return,
        };

        let ordered = order_source_vms(&candidates, average, capacity, target);
        let units = relocation_units(&ordered, &candidates);
        let tracking = &self.tracking;
        let planned = plan_internal(
            &mut self.hosts,
            host_id,
            &units,
            &targets,
            |vm_id| tracking.contains(vm_id),
            target,
        );
        if let Some(migrations) = planned.filter(|m| !m.is_empty()) {
            for m in migrations.iter() {
                self.tracking.insert(m.vm_id);
                self.migrate_vm(m.vm_id, m.source, m.target);
                self.hosts.invalidate(m.target, now);
            }
            self.hosts.invalidate(host_id, now);
            self.metrics.borrow_mut().internal_relocations += 1;
            let vm_ids: Vec<u32> = migrations.iter().map(|m| m.vm_id).collect();
            self.log_decision(
                Decision::InternalRelocation,
                format!("vms {:?} from host #{} to host #{}", vm_ids, host_id, migrations[0].target),
            );
            return;
        }

        let external: Vec<VmSnapshot> = candidates
            .into_iter()
            .filter(|vm| !self.app_pool.is_surrogate(vm.app_id))
            .collect();
        let subject = {
            let registry = self.registry.borrow();
            select_external_candidate(&external, |app_id| registry.get_app(app_id).vm_count())
        };
        match subject {
            Some(subject) => self.request_relocation(host_id, subject),
            None => log_debug!(self.ctx, "host #{} is stressed but has no movable vms", host_id),
        }
    }

    fn request_relocation(&mut self, host_id: u32, subject: MigrationSubject) {
        let now = self.ctx.time();
        for vm_id in subject.vm_ids() {
            self.tracking.insert(vm_id);
        }
        self.ledger
            .insert(LedgerEntry::new(subject.clone(), self.id, self.id, now));
        self.hosts.invalidate(host_id, now);
        log_debug!(
            self.ctx,
            "no local target for {} from host #{}, asking cluster",
            subject.key,
            host_id
        );
        self.ctx.emit(
            MigRequest {
                subject,
                origin: self.id,
                sender: self.id,
            },
            self.cluster_manager_id,
            self.sim_config.message_delay,
        );
    }

    /// Tries to reserve hosts of this rack for VMs coming from another rack.
    fn on_mig_request(&mut self, subject: MigrationSubject, origin: u32, sender: u32) {
        let now = self.ctx.time();
        let (_, targets) = self.start_planning();
        let groups = ConstraintGroups::from_vms(subject.vms.iter().cloned());
        match place(&mut self.hosts, &groups, &targets, self.sim_config.target_utilization) {
            Ok(assignments) => {
                for a in assignments.iter() {
                    self.hosts.invalidate(a.host_id, now);
                }
                log_debug!(self.ctx, "accepted {} from rack #{}", subject.key, origin);
                self.ctx.emit(
                    MigAccept {
                        key: subject.key,
                        acceptor: self.id,
                        targets: assignments,
                        sender: self.id,
                    },
                    sender,
                    self.sim_config.message_delay,
                );
            }
            Err(failure) => {
                rollback(&mut self.hosts, &failure.placed);
                log_debug!(self.ctx, "rejected {}: {}", subject.key, failure);
                self.ctx.emit(
                    MigReject {
                        key: subject.key,
                        sender: self.id,
                    },
                    sender,
                    self.sim_config.message_delay,
                );
            }
        }
    }

    fn on_mig_accept(&mut self, key: SubjectKey, acceptor: u32, targets: Vec<Assignment>) {
        let entry = self.ledger.take(key);
        let now = self.ctx.time();
        let app_id = entry.subject.app_id();
        let transfer = match key {
            SubjectKey::App(_) => {
                self.app_pool.remove(app_id);
                AppTransfer::Whole
            }
            SubjectKey::Vm(vm_id) => {
                if self.app_pool.add_surrogate(app_id, vm_id, acceptor) {
                    log_debug!(self.ctx, "app #{} is broken", app_id);
                    self.ctx
                        .emit_self(RepairBrokenApp { app_id }, self.sim_config.repair_period);
                }
                AppTransfer::Surrogate { master: self.id }
            }
        };
        for a in targets.iter() {
            let source = self.registry.borrow().vm_location(a.vm_id);
            match source {
                Some(source) => {
                    self.migrate_vm(a.vm_id, source, a.host_id);
                    self.hosts.invalidate(source, now);
                    self.handoffs.insert(
                        a.vm_id,
                        Handoff {
                            app_id,
                            rack: acceptor,
                            transfer,
                        },
                    );
                }
                None => log_error!(self.ctx, "vm #{} has no location", a.vm_id),
            }
        }
        self.ctx.emit(
            IncomingMigration {
                app_id,
                transfer,
                vm_ids: entry.subject.vm_ids(),
                sender: self.id,
            },
            acceptor,
            self.sim_config.message_delay,
        );
        self.metrics.borrow_mut().external_relocations += 1;
        self.log_decision(
            Decision::ExternalRelocation,
            format!("{} to rack #{}", key, acceptor),
        );
    }

    fn on_mig_reject(&mut self, key: SubjectKey) {
        let entry = self.ledger.take(key);
        for vm_id in entry.subject.vm_ids() {
            self.tracking.remove(vm_id);
        }
        self.metrics.borrow_mut().relocation_rejections += 1;
        self.log_decision(Decision::RelocationRejected, format!("{} stays in place", key));
    }

    fn on_incoming_migration(&mut self, app_id: u32, transfer: AppTransfer, vm_ids: Vec<u32>, sender: u32) {
        log_trace!(self.ctx, "receiving vms {:?} of app #{} from rack #{}", vm_ids, app_id, sender);
        self.vm_pool.extend(vm_ids.iter().copied());
        match transfer {
            AppTransfer::Whole => self.app_pool.insert_master(app_id),
            AppTransfer::Surrogate { master } => {
                for vm_id in vm_ids {
                    self.app_pool.insert_surrogate(app_id, master, vm_id);
                }
            }
            AppTransfer::Return => {
                for vm_id in vm_ids {
                    self.app_pool.surrogate_returned(app_id, vm_id);
                }
            }
        }
    }

    fn on_migration_completed(&mut self, vm_id: u32, source_host: u32, target_host: u32) {
        self.tracking.remove(vm_id);
        self.handoffs.remove(&vm_id);
        self.metrics.borrow_mut().migrations_completed += 1;
        if !self.hosts.contains(target_host) {
            self.vm_pool.remove(&vm_id);
            let app_id = self.registry.borrow().get_vm(vm_id).app_id;
            self.app_pool.release_vm(app_id, vm_id);
        }
        let drained = match self.draining.get_mut(&source_host) {
            Some(pending) => {
                pending.remove(&vm_id);
                pending.is_empty()
            }
            None => false,
        };
        if drained {
            self.draining.remove(&source_host);
            self.hosts.invalidate(source_host, self.ctx.time());
            self.ctx
                .emit(ShutdownHost {}, source_host, self.sim_config.message_delay);
            self.log_decision(Decision::Shutdown, format!("drained host #{}", source_host));
        }
    }

    /// The VM stays on its source host. Ownership handed over to another rack is taken back.
    fn on_migration_failed(&mut self, vm_id: u32, source_host: u32, target_host: u32) {
        let now = self.ctx.time();
        self.tracking.remove(vm_id);
        self.metrics.borrow_mut().migrations_failed += 1;
        if self.draining.remove(&source_host).is_some() {
            log_debug!(self.ctx, "drain of host #{} cancelled", source_host);
        }
        self.hosts.invalidate(source_host, now);
        if self.hosts.contains(target_host) {
            self.hosts.invalidate(target_host, now);
        }
        if let Some(handoff) = self.handoffs.remove(&vm_id) {
            match handoff.transfer {
                AppTransfer::Whole => self.app_pool.insert_master(handoff.app_id),
                AppTransfer::Surrogate { .. } => self.app_pool.surrogate_returned(handoff.app_id, vm_id),
                AppTransfer::Return => {}
            }
            self.ctx.emit(
                IncomingMigrationCancelled {
                    app_id: handoff.app_id,
                    transfer: handoff.transfer,
                    vm_id,
                    sender: self.id,
                },
                handoff.rack,
                self.sim_config.message_delay,
            );
        }
        log_warn!(self.ctx, "migration of vm #{} from host #{} failed", vm_id, source_host);
    }

    fn on_incoming_migration_cancelled(&mut self, app_id: u32, transfer: AppTransfer, vm_id: u32, sender: u32) {
        self.vm_pool.remove(&vm_id);
        match transfer {
            AppTransfer::Whole => {
                self.app_pool.remove(app_id);
            }
            AppTransfer::Surrogate { .. } => self.app_pool.release_vm(app_id, vm_id),
            AppTransfer::Return => {
                if self.app_pool.add_surrogate(app_id, vm_id, sender) {
                    self.ctx
                        .emit_self(RepairBrokenApp { app_id }, self.sim_config.repair_period);
                }
            }
        }
    }

    /// Places a new application entirely inside this rack.
    fn on_placement_request(&mut self, app_id: u32, sender: u32) {
        let now = self.ctx.time();
        let vms = self.registry.borrow().app_demand(app_id);
        let (_, targets) = self.start_planning();
        let groups = ConstraintGroups::from_vms(vms);
        match place(&mut self.hosts, &groups, &targets, self.sim_config.target_utilization) {
            Ok(assignments) => {
                for a in assignments.iter() {
                    self.ctx.emit(
                        InstantiateVm {
                            vm_id: a.vm_id,
                            manager: self.id,
                        },
                        a.host_id,
                        self.sim_config.message_delay,
                    );
                    self.vm_pool.insert(a.vm_id);
                    self.hosts.invalidate(a.host_id, now);
                }
                self.app_pool.insert_master(app_id);
                self.log_decision(
                    Decision::Placement,
                    format!("app #{} on hosts {:?}", app_id, assignments.iter().map(|a| a.host_id).collect::<Vec<_>>()),
                );
                self.ctx.emit(
                    PlacementAccept { app_id, sender: self.id },
                    sender,
                    self.sim_config.message_delay,
                );
            }
            Err(failure) => {
                rollback(&mut self.hosts, &failure.placed);
                log_debug!(self.ctx, "can't place app #{}: {}", app_id, failure);
                self.ctx.emit(
                    PlacementReject { app_id, sender: self.id },
                    sender,
                    self.sim_config.message_delay,
                );
            }
        }
    }

    fn on_consolidate(&mut self) {
        let now = self.ctx.time();
        let (classification, _) = self.start_planning();
        let policy = ConsolidationPolicy {
            source_order: self.sim_config.consolidation_source_order.clone(),
            target_order: self.sim_config.consolidation_target_order.clone(),
            vm_order: self.sim_config.consolidation_vm_order.clone(),
            target_utilization: self.sim_config.target_utilization,
        };
        let plan = {
            let tracking = &self.tracking;
            let registry = self.registry.borrow();
            plan_consolidation(&mut self.hosts, &classification, &policy, |vm_id| {
                tracking.contains(vm_id) || registry.vm_status(vm_id) != VmStatus::Running
            })
        };

        for host_id in plan.shutdowns {
            self.hosts.invalidate(host_id, now);
            self.ctx
                .emit(ShutdownHost {}, host_id, self.sim_config.message_delay);
            self.log_decision(Decision::Shutdown, format!("empty host #{}", host_id));
        }
        for drain in plan.drains {
            let mut pending = BTreeSet::new();
            for m in drain.migrations.iter() {
                self.tracking.insert(m.vm_id);
                self.migrate_vm(m.vm_id, m.source, m.target);
                self.hosts.invalidate(m.target, now);
                pending.insert(m.vm_id);
            }
            self.metrics.borrow_mut().consolidation_migrations += drain.migrations.len() as u64;
            self.hosts.invalidate(drain.source, now);
            self.draining.insert(drain.source, pending);
            self.log_decision(
                Decision::Consolidation,
                format!("draining host #{} with {} migrations", drain.source, drain.migrations.len()),
            );
        }

        if self.sim_config.is_running(now) {
            self.ctx
                .emit_self(Consolidate {}, self.sim_config.consolidation_interval);
        }
    }

    fn on_repair_broken_app(&mut self, app_id: u32) {
        if !self.app_pool.is_broken(app_id) {
            return;
        }
        for holder in self.app_pool.holders(app_id) {
            self.ctx.emit(
                SurrogateAppRequest { app_id, master: self.id },
                holder,
                self.sim_config.message_delay,
            );
        }
        if self.sim_config.is_running(self.ctx.time()) {
            self.ctx
                .emit_self(RepairBrokenApp { app_id }, self.sim_config.repair_period);
        }
    }

    /// Holder side: offers the surrogate VMs back to the master.
    fn on_surrogate_app_request(&mut self, app_id: u32, master: u32) {
        self.app_pool.set_master(app_id, master);
        let now = self.ctx.time();
        for vm_id in self.app_pool.surrogate_vms(app_id) {
            if self.tracking.contains(vm_id) || self.registry.borrow().vm_status(vm_id) != VmStatus::Running {
                continue;
            }
            self.tracking.insert(vm_id);
            let vm = self.registry.borrow().snapshot(vm_id, now);
            self.ctx.emit(
                SurrogateAppData {
                    app_id,
                    vm,
                    holder: self.id,
                },
                master,
                self.sim_config.message_delay,
            );
        }
    }

    fn repair_target(&self, vm: &VmSnapshot, classification: &Classification, targets: &[u32]) -> Option<u32> {
        let target = self.sim_config.target_utilization;
        if let TaskConstraint::Affinity { .. } = vm.constraint {
            let group_host = self.hosts.iter().find(|h| {
                h.store
                    .sandbox()
                    .vms
                    .iter()
                    .any(|other| other.app_id == vm.app_id && other.constraint == vm.constraint)
            });
            if let Some(host) = group_host {
                let usable = matches!(classification.class_of(host.id), Some(c) if c != UtilizationClass::Stressed);
                return (usable && fits(host, std::slice::from_ref(vm), target)).then(|| host.id);
            }
        }
        targets
            .iter()
            .copied()
            .find(|id| self.hosts.get(*id).map_or(false, |h| fits(h, std::slice::from_ref(vm), target)))
    }

    /// Master side: looks for a local host for a surrogate VM.
    fn on_surrogate_app_data(&mut self, app_id: u32, vm: VmSnapshot, holder: u32) {
        let (classification, targets) = self.start_planning();
        match self.repair_target(&vm, &classification, &targets) {
            Some(host_id) => {
                if let Some(host) = self.hosts.get_mut(host_id) {
                    host.store.sandbox_mut().instantiate(vm.clone());
                }
                self.hosts.invalidate(host_id, self.ctx.time());
                self.log_decision(
                    Decision::Repair,
                    format!("vm #{} of app #{} returns to host #{}", vm.id, app_id, host_id),
                );
                self.ctx.emit(
                    SurrogateAppMigrate {
                        app_id,
                        vm_id: vm.id,
                        target_host: host_id,
                    },
                    holder,
                    self.sim_config.message_delay,
                );
            }
            None => {
                log_debug!(self.ctx, "no host to reunite vm #{} of app #{}", vm.id, app_id);
                self.ctx.emit(
                    SurrogateAppReject { app_id, vm_id: vm.id },
                    holder,
                    self.sim_config.message_delay,
                );
            }
        }
    }

    fn on_surrogate_app_migrate(&mut self, app_id: u32, vm_id: u32, target_host: u32) {
        let source = self.registry.borrow().vm_location(vm_id);
        let master = self.app_pool.master_of(app_id);
        match (source, master) {
            (Some(source), Some(master)) if self.hosts.contains(source) => {
                self.migrate_vm(vm_id, source, target_host);
                self.hosts.invalidate(source, self.ctx.time());
                self.handoffs.insert(
                    vm_id,
                    Handoff {
                        app_id,
                        rack: master,
                        transfer: AppTransfer::Return,
                    },
                );
                self.metrics.borrow_mut().repair_migrations += 1;
                self.ctx.emit(
                    IncomingMigration {
                        app_id,
                        transfer: AppTransfer::Return,
                        vm_ids: vec![vm_id],
                        sender: self.id,
                    },
                    master,
                    self.sim_config.message_delay,
                );
            }
            _ => {
                log_warn!(self.ctx, "surrogate vm #{} of app #{} is no longer here", vm_id, app_id);
                self.tracking.remove(vm_id);
            }
        }
    }

    fn send_rack_status(&mut self) {
        let now = self.ctx.time();
        let status = RackStatus::from_hosts(self.id, now, &self.hosts, self.sim_config.target_utilization);
        self.ctx.emit(
            RackStatusReport { status },
            self.cluster_manager_id,
            self.sim_config.message_delay,
        );
        if self.sim_config.is_running(now) {
            self.ctx
                .emit_self(SendRackStatus {}, self.sim_config.rack_status_period);
        }
    }
}

#[derive(Serialize)]
pub struct SendRackStatus {}

#[derive(Serialize)]
pub struct Consolidate {}

impl EventHandler for RackManager {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            HostStatusReport { status } => {
                self.on_host_status(status);
            }
            StressCheck { host_id } => {
                self.on_stress_check(host_id);
            }
            MigRequest {
                subject,
                origin,
                sender,
            } => {
                self.on_mig_request(subject, origin, sender);
            }
            MigAccept {
                key,
                acceptor,
                targets,
                sender: _,
            } => {
                self.on_mig_accept(key, acceptor, targets);
            }
            MigReject { key, sender: _ } => {
                self.on_mig_reject(key);
            }
            IncomingMigration {
                app_id,
                transfer,
                vm_ids,
                sender,
            } => {
                self.on_incoming_migration(app_id, transfer, vm_ids, sender);
            }
            MigrationCompleted {
                vm_id,
                source_host,
                target_host,
            } => {
                self.on_migration_completed(vm_id, source_host, target_host);
            }
            MigrationFailed {
                vm_id,
                source_host,
                target_host,
            } => {
                self.on_migration_failed(vm_id, source_host, target_host);
            }
            IncomingMigrationCancelled {
                app_id,
                transfer,
                vm_id,
                sender,
            } => {
                self.on_incoming_migration_cancelled(app_id, transfer, vm_id, sender);
            }
            PlacementRequest { app_id, sender } => {
                self.on_placement_request(app_id, sender);
            }
            VmInstantiated { vm_id, host_id } => {
                log_trace!(self.ctx, "vm #{} instantiated on host #{}", vm_id, host_id);
                self.metrics.borrow_mut().instantiations += 1;
            }
            Consolidate {} => {
                self.on_consolidate();
            }
            RepairBrokenApp { app_id } => {
                self.on_repair_broken_app(app_id);
            }
            SurrogateAppRequest { app_id, master } => {
                self.on_surrogate_app_request(app_id, master);
            }
            SurrogateAppData { app_id, vm, holder } => {
                self.on_surrogate_app_data(app_id, vm, holder);
            }
            SurrogateAppMigrate {
                app_id,
                vm_id,
                target_host,
            } => {
                self.on_surrogate_app_migrate(app_id, vm_id, target_host);
            }
            SurrogateAppReject { app_id, vm_id } => {
                log_trace!(self.ctx, "vm #{} of app #{} stays here", vm_id, app_id);
                self.tracking.remove(vm_id);
            }
            SendRackStatus {} => {
                self.send_rack_status();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dslab_core::simulation::Simulation;
    use sugars::{rc, refcell};

    use crate::core::app_pool::AppRole;
    use crate::core::application::{ApplicationSpec, TaskSpec};
    use crate::core::common::Resources;
    use crate::core::host_manager::HostManager;
    use crate::core::load_model::ConstLoadModel;
    use crate::core::logger::StdoutLogger;
    use crate::core::power_model::LinearPowerModel;

    fn host_model() -> HostDescription {
        HostDescription::new(4, 2500, 16384, 102400, 102400, Box::new(LinearPowerModel::new(250., 150.)))
    }

    struct Setup {
        sim: Simulation,
        registry: Rc<RefCell<VmRegistry>>,
        metrics: Rc<RefCell<Metrics>>,
        sim_config: Rc<SimulationConfig>,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                sim: Simulation::new(123),
                registry: rc!(refcell!(VmRegistry::new())),
                metrics: rc!(refcell!(Metrics::new())),
                sim_config: rc!(SimulationConfig::new()),
            }
        }

        fn add_rack(&mut self, name: &str) -> Rc<RefCell<RackManager>> {
            let logger: Box<dyn Logger> = Box::new(StdoutLogger::new());
            let rack = rc!(refcell!(RackManager::new(
                0,
                self.registry.clone(),
                self.metrics.clone(),
                rc!(refcell!(logger)),
                self.sim.create_context(name),
                self.sim_config.clone(),
            )));
            self.sim.add_handler(name, rack.clone());
            rack
        }

        fn add_host(&mut self, name: &str, rack: &Rc<RefCell<RackManager>>) -> u32 {
            let rack_id = rack.borrow().id;
            let host = rc!(refcell!(HostManager::new(
                host_model(),
                PowerState::On,
                rack_id,
                self.registry.clone(),
                self.metrics.clone(),
                self.sim.create_context(name),
                self.sim_config.clone(),
            )));
            let host_id = self.sim.add_handler(name, host);
            rack.borrow_mut().add_host(host_id, host_model(), PowerState::On);
            host_id
        }

        /// Registers a single-VM application which runs nowhere.
        fn register_app(&mut self) -> (u32, u32) {
            let spec = ApplicationSpec::new().with_task(TaskSpec::new(
                1,
                1,
                2500,
                Resources::new(2000., 1024, 100, 100),
                TaskConstraint::Independent,
                Box::new(ConstLoadModel::new(1.)),
            ));
            let app_id = self.registry.borrow_mut().register_app(&spec);
            let vm_id = self.registry.borrow().get_app(app_id).vm_ids()[0];
            (app_id, vm_id)
        }
    }

    #[test]
    fn test_refused_drain_migration_releases_markers() {
        let mut setup = Setup::new();
        let rack = setup.add_rack("rack");
        let source = setup.add_host("host-0", &rack);
        let target = setup.add_host("host-1", &rack);
        let (app_id, vm_id) = setup.register_app();
        {
            let mut rack = rack.borrow_mut();
            rack.add_deployed_app(app_id, &[vm_id]);
            rack.tracking.insert(vm_id);
            rack.draining.insert(source, BTreeSet::from([vm_id]));
            rack.migrate_vm(vm_id, source, target);
        }

        setup.sim.step_for_duration(5.);

        let rack = rack.borrow();
        assert!(rack.tracking().is_empty());
        assert!(rack.draining.is_empty());
        assert!(rack.vm_pool().contains(&vm_id));
        assert!(!rack.hosts().get(source).unwrap().store.is_valid());
        assert!(!rack.hosts().get(target).unwrap().store.is_valid());
        let metrics = setup.metrics.borrow();
        assert_eq!(metrics.migrations_issued, 1);
        assert_eq!(metrics.migrations_failed, 1);
        assert_eq!(metrics.migrations_completed, 0);
        assert_eq!(metrics.hosts_shut_down, 0);
        assert_eq!(setup.registry.borrow().vm_location(vm_id), None);
    }

    #[test]
    fn test_refused_external_migration_returns_ownership() {
        let mut setup = Setup::new();
        let origin = setup.add_rack("rack-a");
        let acceptor = setup.add_rack("rack-b");
        let source = setup.add_host("host-a", &origin);
        let target = setup.add_host("host-b", &acceptor);
        let acceptor_id = acceptor.borrow().id;
        let (app_id, vm_id) = setup.register_app();
        // registry places the vm on the source host, which doesn't run it
        setup.registry.borrow_mut().set_vm_location(vm_id, source);
        {
            let subject = MigrationSubject {
                key: SubjectKey::App(app_id),
                vms: setup.registry.borrow().app_demand(app_id),
            };
            let mut origin = origin.borrow_mut();
            let origin_id = origin.id;
            origin.add_deployed_app(app_id, &[vm_id]);
            origin.tracking.insert(vm_id);
            origin.ledger.insert(LedgerEntry::new(subject, origin_id, origin_id, 0.));
            origin.on_mig_accept(
                SubjectKey::App(app_id),
                acceptor_id,
                vec![Assignment { vm_id, host_id: target }],
            );
        }

        setup.sim.step_for_duration(5.);

        let origin = origin.borrow();
        assert!(origin.tracking().is_empty());
        assert!(origin.ledger().is_empty());
        assert!(origin.handoffs.is_empty());
        assert!(origin.vm_pool().contains(&vm_id));
        assert!(!origin.app_pool().is_broken(app_id));
        assert!(matches!(origin.app_pool().get(app_id), Some(AppRole::Master { .. })));

        let acceptor = acceptor.borrow();
        assert!(!acceptor.vm_pool().contains(&vm_id));
        assert!(acceptor.app_pool().get(app_id).is_none());
        assert_eq!(setup.metrics.borrow().migrations_failed, 1);
        assert_eq!(setup.registry.borrow().vm_location(vm_id), Some(source));
    }

    #[test]
    fn test_refused_surrogate_migration_makes_app_whole_again() {
        let mut setup = Setup::new();
        let origin = setup.add_rack("rack-a");
        let acceptor = setup.add_rack("rack-b");
        let source = setup.add_host("host-a", &origin);
        let target = setup.add_host("host-b", &acceptor);
        let acceptor_id = acceptor.borrow().id;
        let (app_id, vm_id) = setup.register_app();
        setup.registry.borrow_mut().set_vm_location(vm_id, source);
        {
            let subject = MigrationSubject {
                key: SubjectKey::Vm(vm_id),
                vms: setup.registry.borrow().app_demand(app_id),
            };
            let mut origin = origin.borrow_mut();
            let origin_id = origin.id;
            origin.add_deployed_app(app_id, &[vm_id]);
            origin.tracking.insert(vm_id);
            origin.ledger.insert(LedgerEntry::new(subject, origin_id, origin_id, 0.));
            origin.on_mig_accept(SubjectKey::Vm(vm_id), acceptor_id, vec![Assignment { vm_id, host_id: target }]);
            assert!(origin.app_pool().is_broken(app_id));
        }

        setup.sim.step_for_duration(5.);

        assert!(!origin.borrow().app_pool().is_broken(app_id));
        assert!(origin.borrow().tracking().is_empty());
        assert!(acceptor.borrow().app_pool().get(app_id).is_none());
        assert!(!acceptor.borrow().vm_pool().contains(&vm_id));
    }
}
