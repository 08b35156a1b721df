//! Local storage containers
//!
//! Volume groups and ZFS pools on individual nodes, managed through the
//! remote executor.

pub mod pools;

pub use pools::PoolManager;
