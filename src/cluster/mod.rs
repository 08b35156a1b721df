//! Cluster membership
//!
//! Tracks the set of reachable storage nodes and owns the
//! address/hostname resolution tables every other component borrows a
//! read-only view of.

pub mod registry;

pub use registry::{ComponentStatus, ComponentsReport, NodeRegistry};
