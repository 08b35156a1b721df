//! Persistent catalog
//!
//! The declared model of the cluster: nodes, pools, resources, gateways
//! and HA overlays, persisted across controller restarts. All components
//! share one catalog and serialize writes through it.

pub mod records;
pub mod store;

pub use records::{
    BackingKind, FsKind, GatewayKind, GatewayRecord, HaRecord, NodeRecord, NodeState, PoolKind,
    PoolRecord, Protocol, ResourceRecord, VolumeRecord,
};
pub use store::{Catalog, CatalogConfig, CatalogStore, FileCatalog, Namespace};
