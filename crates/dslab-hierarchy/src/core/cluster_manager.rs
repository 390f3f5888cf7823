use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;

use dslab_core::cast;
use dslab_core::context::SimulationContext;
use dslab_core::event::Event;
use dslab_core::handler::EventHandler;
use dslab_core::{log_debug, log_trace, log_warn};

use crate::core::classifier::Classifier;
use crate::core::cluster::ClusterStatus;
use crate::core::config::SimulationConfig;
use crate::core::events::placement::{PlacementAccept, PlacementReject, PlacementRequest};
use crate::core::events::relocation::{MigAccept, MigReject, MigRequest};
use crate::core::events::status::{ClusterStatusReport, RackStatusReport};
use crate::core::host::PowerState;
use crate::core::ledger::{Ledger, LedgerEntry, MigrationSubject, SubjectKey};
use crate::core::placement::Assignment;
use crate::core::rack::{select_rack, RackDescription, RackRecord, RackStatus};
use crate::core::vm_registry::VmRegistry;

/// Routes relocation and placement requests between racks of a cluster and the data centre.
pub struct ClusterManager {
    pub id: u32,
    dc_manager_id: u32,
    racks: IndexMap<u32, RackRecord>,
    classifier: Classifier,
    relocations: Ledger,
    placements: Ledger,
    registry: Rc<RefCell<VmRegistry>>,
    ctx: SimulationContext,
    sim_config: Rc<SimulationConfig>,
}

impl ClusterManager {
    pub fn new(
        dc_manager_id: u32,
        registry: Rc<RefCell<VmRegistry>>,
        ctx: SimulationContext,
        sim_config: Rc<SimulationConfig>,
    ) -> Self {
        Self {
            id: ctx.id(),
            dc_manager_id,
            racks: IndexMap::new(),
            classifier: sim_config.classifier(),
            relocations: Ledger::new(),
            placements: Ledger::new(),
            registry,
            ctx,
            sim_config,
        }
    }

    pub fn add_rack(&mut self, id: u32, description: RackDescription, state: PowerState) {
        self.racks
            .insert(id, RackRecord::new(id, description, state, self.sim_config.window_size));
    }

    pub fn racks(&self) -> &IndexMap<u32, RackRecord> {
        &self.racks
    }

    pub fn relocation_ledger(&self) -> &Ledger {
        &self.relocations
    }

    pub fn placement_ledger(&self) -> &Ledger {
        &self.placements
    }

    fn on_rack_status(&mut self, status: RackStatus) {
        match self.racks.get_mut(&status.rack_id) {
            Some(rack) => {
                if status.vm_count > 0 {
                    rack.active = true;
                }
                rack.store.push(status);
            }
            None => log_warn!(self.ctx, "status of unknown rack #{}", status.rack_id),
        }
    }

    fn on_mig_request(&mut self, subject: MigrationSubject, origin: u32, sender: u32) {
        let key = subject.key;
        let mut entry = LedgerEntry::new(subject, origin, sender, self.ctx.time());
        for scope in [sender, origin] {
            if self.racks.contains_key(&scope) {
                entry.tried.insert(scope);
            }
        }
        self.relocations.insert(entry);
        self.try_relocation(key);
    }

    fn try_relocation(&mut self, key: SubjectKey) {
        let entry = self.relocations.get_mut(key);
        if let Some(rack_id) = choose_rack(&mut self.racks, entry, &self.classifier, self.ctx.time()) {
            log_trace!(self.ctx, "offering {} to rack #{}", key, rack_id);
            self.ctx.emit(
                MigRequest {
                    subject: entry.subject.clone(),
                    origin: entry.origin,
                    sender: self.id,
                },
                rack_id,
                self.sim_config.message_delay,
            );
            return;
        }
        if self.racks.contains_key(&entry.sender) && !entry.escalated {
            entry.escalated = true;
            log_debug!(self.ctx, "no rack can take {}, asking data centre", key);
            self.ctx.emit(
                MigRequest {
                    subject: entry.subject.clone(),
                    origin: entry.origin,
                    sender: self.id,
                },
                self.dc_manager_id,
                self.sim_config.message_delay,
            );
        } else {
            let entry = self.relocations.take(key);
            log_debug!(self.ctx, "no rack can take {}", key);
            self.ctx.emit(
                MigReject { key, sender: self.id },
                entry.sender,
                self.sim_config.message_delay,
            );
        }
    }

    fn on_mig_reject(&mut self, key: SubjectKey, sender: u32) {
        if sender == self.dc_manager_id {
            let entry = self.relocations.take(key);
            self.ctx.emit(
                MigReject { key, sender: self.id },
                entry.sender,
                self.sim_config.message_delay,
            );
        } else {
            self.try_relocation(key);
        }
    }

    fn on_mig_accept(&mut self, key: SubjectKey, acceptor: u32, targets: Vec<Assignment>) {
        let entry = self.relocations.take(key);
        self.ctx.emit(
            MigAccept {
                key,
                acceptor,
                targets,
                sender: self.id,
            },
            entry.sender,
            self.sim_config.message_delay,
        );
    }

    fn on_placement_request(&mut self, app_id: u32, sender: u32) {
        let subject = MigrationSubject {
            key: SubjectKey::App(app_id),
            vms: self.registry.borrow().app_demand(app_id),
        };
        self.placements
            .insert(LedgerEntry::new(subject, self.id, sender, self.ctx.time()));
        self.try_placement(app_id);
    }

    fn try_placement(&mut self, app_id: u32) {
        let key = SubjectKey::App(app_id);
        let entry = self.placements.get_mut(key);
        match choose_rack(&mut self.racks, entry, &self.classifier, self.ctx.time()) {
            Some(rack_id) => {
                log_trace!(self.ctx, "offering app #{} to rack #{}", app_id, rack_id);
                self.ctx.emit(
                    PlacementRequest { app_id, sender: self.id },
                    rack_id,
                    self.sim_config.message_delay,
                );
            }
            None => {
                let entry = self.placements.take(key);
                log_debug!(self.ctx, "no rack can place app #{}", app_id);
                self.ctx.emit(
                    PlacementReject { app_id, sender: self.id },
                    entry.sender,
                    self.sim_config.message_delay,
                );
            }
        }
    }

    fn on_placement_accept(&mut self, app_id: u32) {
        let entry = self.placements.take(SubjectKey::App(app_id));
        self.ctx.emit(
            PlacementAccept { app_id, sender: self.id },
            entry.sender,
            self.sim_config.message_delay,
        );
    }

    fn send_cluster_status(&mut self) {
        let now = self.ctx.time();
        let status = ClusterStatus::from_racks(self.id, now, &self.racks);
        self.ctx.emit(
            ClusterStatusReport { status },
            self.dc_manager_id,
            self.sim_config.message_delay,
        );
        if self.sim_config.is_running(now) {
            self.ctx
                .emit_self(SendClusterStatus {}, self.sim_config.cluster_status_period);
        }
    }
}

/// Picks a rack not tried yet for the request, invalidates it and marks it active.
fn choose_rack(
    racks: &mut IndexMap<u32, RackRecord>,
    entry: &mut LedgerEntry,
    classifier: &Classifier,
    time: f64,
) -> Option<u32> {
    let rack_id = select_rack(racks.values(), &entry.subject.vms, &entry.tried, classifier)?;
    if let Some(rack) = racks.get_mut(&rack_id) {
        rack.store.invalidate(time);
        rack.active = true;
    }
    entry.tried.insert(rack_id);
    Some(rack_id)
}

#[derive(Serialize)]
pub struct SendClusterStatus {}

impl EventHandler for ClusterManager {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            RackStatusReport { status } => {
                self.on_rack_status(status);
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
            MigReject { key, sender } => {
                self.on_mig_reject(key, sender);
            }
            PlacementRequest { app_id, sender } => {
                self.on_placement_request(app_id, sender);
            }
            PlacementAccept { app_id, sender: _ } => {
                self.on_placement_accept(app_id);
            }
            PlacementReject { app_id, sender: _ } => {
                self.try_placement(app_id);
            }
            SendClusterStatus {} => {
                self.send_cluster_status();
            }
        })
    }
}
