//! High availability overlay
//!
//! Converts a replicated resource into a service the on-node promoter
//! daemon fails over autonomously: filesystem, mount unit, floating
//! address, and the service set, all driven from a generated promoter
//! snippet.

pub mod controller;
pub mod promoter;

pub use controller::{HaController, MakeHaRequest};
