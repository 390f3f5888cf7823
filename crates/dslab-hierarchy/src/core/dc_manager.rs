use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use dslab_core::cast;
use dslab_core::context::SimulationContext;
use dslab_core::event::Event;
use dslab_core::handler::EventHandler;
use dslab_core::{log_debug, log_trace, log_warn};

use crate::core::classifier::Classifier;
use crate::core::cluster::{select_cluster, ClusterDescription, ClusterRecord, ClusterStatus};
use crate::core::config::SimulationConfig;
use crate::core::events::placement::{PlacementAccept, PlacementReject, PlacementRequest};
use crate::core::events::relocation::{MigAccept, MigReject, MigRequest};
use crate::core::events::status::ClusterStatusReport;
use crate::core::ledger::{Ledger, LedgerEntry, MigrationSubject, SubjectKey};
use crate::core::logger::{Decision, Logger};
use crate::core::metrics::Metrics;
use crate::core::placement::Assignment;
use crate::core::vm_registry::VmRegistry;

/// Root of the hierarchy. Accepts applications from clients and routes requests between clusters.
pub struct DcManager {
    pub id: u32,
    clusters: IndexMap<u32, ClusterRecord>,
    classifier: Classifier,
    relocations: Ledger,
    placements: Ledger,
    registry: Rc<RefCell<VmRegistry>>,
    metrics: Rc<RefCell<Metrics>>,
    logger: Rc<RefCell<Box<dyn Logger>>>,
    ctx: SimulationContext,
    sim_config: Rc<SimulationConfig>,
}

impl DcManager {
    pub fn new(
        registry: Rc<RefCell<VmRegistry>>,
        metrics: Rc<RefCell<Metrics>>,
        logger: Rc<RefCell<Box<dyn Logger>>>,
        ctx: SimulationContext,
        sim_config: Rc<SimulationConfig>,
    ) -> Self {
        Self {
            id: ctx.id(),
            clusters: IndexMap::new(),
            classifier: sim_config.classifier(),
            relocations: Ledger::new(),
            placements: Ledger::new(),
            registry,
            metrics,
            logger,
            ctx,
            sim_config,
        }
    }

    pub fn add_cluster(&mut self, id: u32, description: ClusterDescription) {
        self.clusters
            .insert(id, ClusterRecord::new(id, description, self.sim_config.window_size));
    }

    pub fn clusters(&self) -> &IndexMap<u32, ClusterRecord> {
        &self.clusters
    }

    pub fn relocation_ledger(&self) -> &Ledger {
        &self.relocations
    }

    pub fn placement_ledger(&self) -> &Ledger {
        &self.placements
    }

    fn on_cluster_status(&mut self, status: ClusterStatus) {
        match self.clusters.get_mut(&status.cluster_id) {
            Some(cluster) => {
                if status.vm_count > 0 {
                    cluster.active = true;
                }
                cluster.store.push(status);
            }
            None => log_warn!(self.ctx, "status of unknown cluster #{}", status.cluster_id),
        }
    }

    fn on_mig_request(&mut self, subject: MigrationSubject, origin: u32, sender: u32) {
        let key = subject.key;
        let mut entry = LedgerEntry::new(subject, origin, sender, self.ctx.time());
        entry.tried.insert(sender);
        self.relocations.insert(entry);
        self.try_relocation(key);
    }

    fn try_relocation(&mut self, key: SubjectKey) {
        let entry = self.relocations.get_mut(key);
        match choose_cluster(&mut self.clusters, entry, &self.classifier, self.ctx.time()) {
            Some(cluster_id) => {
                log_trace!(self.ctx, "offering {} to cluster #{}", key, cluster_id);
                self.ctx.emit(
                    MigRequest {
                        subject: entry.subject.clone(),
                        origin: entry.origin,
                        sender: self.id,
                    },
                    cluster_id,
                    self.sim_config.message_delay,
                );
            }
            None => {
                let entry = self.relocations.take(key);
                log_debug!(self.ctx, "no cluster can take {}", key);
                self.ctx.emit(
                    MigReject { key, sender: self.id },
                    entry.sender,
                    self.sim_config.message_delay,
                );
            }
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

    /// Starts placement of a registered application.
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
        match choose_cluster(&mut self.clusters, entry, &self.classifier, self.ctx.time()) {
            Some(cluster_id) => {
                log_trace!(self.ctx, "offering app #{} to cluster #{}", app_id, cluster_id);
                self.ctx.emit(
                    PlacementRequest { app_id, sender: self.id },
                    cluster_id,
                    self.sim_config.message_delay,
                );
            }
            None => {
                self.placements.take(key);
                self.metrics.borrow_mut().placement_failures += 1;
                self.logger.borrow_mut().log_decision(
                    &self.ctx,
                    Decision::PlacementFailure,
                    format!("app #{} can't be placed", app_id),
                );
            }
        }
    }

    fn on_placement_accept(&mut self, app_id: u32) {
        self.placements.take(SubjectKey::App(app_id));
        self.metrics.borrow_mut().placements += 1;
        log_debug!(self.ctx, "app #{} placed", app_id);
    }
}

/// Picks a cluster not tried yet for the request, invalidates it and marks it active.
fn choose_cluster(
    clusters: &mut IndexMap<u32, ClusterRecord>,
    entry: &mut LedgerEntry,
    classifier: &Classifier,
    time: f64,
) -> Option<u32> {
    let cluster_id = select_cluster(clusters.values(), &entry.subject.vms, &entry.tried, classifier)?;
    if let Some(cluster) = clusters.get_mut(&cluster_id) {
        cluster.store.invalidate(time);
        cluster.active = true;
    }
    entry.tried.insert(cluster_id);
    Some(cluster_id)
}

impl EventHandler for DcManager {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            ClusterStatusReport { status } => {
                self.on_cluster_status(status);
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
                self.try_relocation(key);
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
        })
    }
}
