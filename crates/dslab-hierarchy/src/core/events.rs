//! Standard simulation events.

// STATUS REPORTS //////////////////////////////////////////////////////////////////////////////////

pub mod status {
    use serde::Serialize;

    use crate::core::cluster::ClusterStatus;
    use crate::core::host::HostStatus;
    use crate::core::rack::RackStatus;

    #[derive(Serialize)]
    pub struct HostStatusReport {
        pub status: HostStatus,
    }

    #[derive(Serialize)]
    pub struct RackStatusReport {
        pub status: RackStatus,
    }

    #[derive(Serialize)]
    pub struct ClusterStatusReport {
        pub status: ClusterStatus,
    }
}

// HOST ACTIONS ////////////////////////////////////////////////////////////////////////////////////

pub mod actions {
    use serde::Serialize;

    /// Sent to the source host. `manager` receives the completion.
    #[derive(Serialize)]
    pub struct MigrateVm {
        pub vm_id: u32,
        pub target_host: u32,
        pub manager: u32,
    }

    /// Sent by the source host to the target host.
    #[derive(Serialize)]
    pub struct MigrationStart {
        pub vm_id: u32,
        pub source_host: u32,
        pub manager: u32,
    }

    #[derive(Serialize)]
    pub struct MigrationFinished {
        pub vm_id: u32,
        pub source_host: u32,
        pub manager: u32,
    }

    /// Sent by the target host to the source host once the VM runs on the target.
    #[derive(Serialize)]
    pub struct ReleaseMigratedVm {
        pub vm_id: u32,
    }

    #[derive(Serialize)]
    pub struct MigrationCompleted {
        pub vm_id: u32,
        pub source_host: u32,
        pub target_host: u32,
    }

    /// Sent by the source host which can't start the migration.
    #[derive(Serialize)]
    pub struct MigrationFailed {
        pub vm_id: u32,
        pub source_host: u32,
        pub target_host: u32,
    }

    #[derive(Serialize)]
    pub struct InstantiateVm {
        pub vm_id: u32,
        pub manager: u32,
    }

    #[derive(Serialize)]
    pub struct VmStarted {
        pub vm_id: u32,
        pub manager: u32,
    }

    #[derive(Serialize)]
    pub struct VmInstantiated {
        pub vm_id: u32,
        pub host_id: u32,
    }

    #[derive(Serialize)]
    pub struct ShutdownHost {}
}

// RELOCATION PROTOCOL /////////////////////////////////////////////////////////////////////////////

pub mod relocation {
    use serde::Serialize;

    use crate::core::ledger::{MigrationSubject, SubjectKey};
    use crate::core::placement::Assignment;

    #[derive(Serialize)]
    pub struct StressCheck {
        pub host_id: u32,
    }

    /// Asks a scope to host the subject. `origin` is the rack owning the VMs, `sender` the
    /// manager expecting the reply.
    #[derive(Serialize)]
    pub struct MigRequest {
        pub subject: MigrationSubject,
        pub origin: u32,
        pub sender: u32,
    }

    #[derive(Serialize)]
    pub struct MigAccept {
        pub key: SubjectKey,
        /// Rack which reserved the targets.
        pub acceptor: u32,
        pub targets: Vec<Assignment>,
        pub sender: u32,
    }

    #[derive(Serialize)]
    pub struct MigReject {
        pub key: SubjectKey,
        pub sender: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub enum AppTransfer {
        /// The receiving rack becomes the owner of the application.
        Whole,
        /// The receiving rack holds the VMs for the `master` rack.
        Surrogate { master: u32 },
        /// Surrogate VMs come back to their owner.
        Return,
    }

    /// Sent by the rack which issued the migrations to the rack receiving the VMs.
    #[derive(Serialize)]
    pub struct IncomingMigration {
        pub app_id: u32,
        pub transfer: AppTransfer,
        pub vm_ids: Vec<u32>,
        pub sender: u32,
    }

    /// Takes back an [`IncomingMigration`] whose VM never left its source host.
    #[derive(Serialize)]
    pub struct IncomingMigrationCancelled {
        pub app_id: u32,
        pub transfer: AppTransfer,
        pub vm_id: u32,
        pub sender: u32,
    }
}

// PLACEMENT PROTOCOL //////////////////////////////////////////////////////////////////////////////

pub mod placement {
    use serde::Serialize;

    #[derive(Serialize)]
    pub struct PlacementRequest {
        pub app_id: u32,
        pub sender: u32,
    }

    #[derive(Serialize)]
    pub struct PlacementAccept {
        pub app_id: u32,
        pub sender: u32,
    }

    #[derive(Serialize)]
    pub struct PlacementReject {
        pub app_id: u32,
        pub sender: u32,
    }
}

// BROKEN APPLICATION REPAIR ///////////////////////////////////////////////////////////////////////

pub mod repair {
    use serde::Serialize;

    use crate::core::vm::VmSnapshot;

    #[derive(Serialize)]
    pub struct RepairBrokenApp {
        pub app_id: u32,
    }

    #[derive(Serialize)]
    pub struct SurrogateAppRequest {
        pub app_id: u32,
        pub master: u32,
    }

    #[derive(Serialize)]
    pub struct SurrogateAppData {
        pub app_id: u32,
        pub vm: VmSnapshot,
        pub holder: u32,
    }

    #[derive(Serialize)]
    pub struct SurrogateAppMigrate {
        pub app_id: u32,
        pub vm_id: u32,
        pub target_host: u32,
    }

    #[derive(Serialize)]
    pub struct SurrogateAppReject {
        pub app_id: u32,
        pub vm_id: u32,
    }
}
