//! SDS Controller - Replicated Block Storage Control Plane
//!
//! The controller orchestrates DRBD-replicated block devices across a
//! cluster of storage nodes: it carves backing volumes out of LVM
//! volume groups or ZFS pools, renders and distributes the driver
//! configuration, sequences metadata creation, bring-up and role
//! assignment, and hands steady-state failover to the on-node
//! drbd-reactor promoter daemon.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Control Surface                         │
//! │            (request dispatch, per-resource locking)            │
//! ├───────────────┬──────────────┬───────────────┬─────────────────┤
//! │ ResourceEngine│ HAController │  PoolManager  │  GatewayBridge  │
//! ├───────────────┴──────────────┴───────────────┴─────────────────┤
//! │          NodeRegistry (membership + resolution tables)         │
//! ├───────────────────────────────┬────────────────────────────────┤
//! │        RemoteExecutor         │            Catalog             │
//! │  (bounded fan-out, local      │   (namespaced records in one   │
//! │   short-circuit, SSH)         │    on-disk state file)         │
//! └───────────────────────────────┴────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`remote`]: command and payload fan-out to node sets
//! - [`catalog`]: persistent records for every entity kind
//! - [`cluster`]: node membership and resolution tables
//! - [`storage`]: volume-group and ZFS pool management
//! - [`resource`]: replicated resource orchestration, config, status
//! - [`ha`]: promoter-managed high availability overlays
//! - [`gateway`]: adapter for the export-protocol managers
//! - [`surface`]: request dispatch
//! - [`error`]: error types and handling

pub mod catalog;
pub mod cluster;
pub mod error;
pub mod gateway;
pub mod ha;
pub mod remote;
pub mod resource;
pub mod storage;
pub mod surface;

// Re-export commonly used types
pub use catalog::{
    BackingKind, Catalog, CatalogConfig, CatalogStore, FileCatalog, FsKind, GatewayKind,
    GatewayRecord, HaRecord, NodeRecord, NodeState, PoolKind, PoolRecord, Protocol,
    ResourceRecord, VolumeRecord,
};
pub use cluster::{ComponentsReport, NodeRegistry};
pub use error::{Error, Result};
pub use gateway::GatewayBridge;
pub use ha::{HaController, MakeHaRequest};
pub use remote::{
    ExecOptions, ExecutorConfig, HostReport, HostResult, LocalIdentity, RemoteExecutor,
    SystemShell, SystemShellConfig,
};
pub use resource::{CreateResourceRequest, ResourceDetails, ResourceEngine, ResourceStatus, Role};
pub use storage::PoolManager;
pub use surface::ControlSurface;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
