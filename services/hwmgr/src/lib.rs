//! Hardware manager.
//!
//! Allocates nodes from a static hardware inventory to NodePool requests:
//! - `allocation`: inventory record, free-node resolution, allocation engine
//! - `provisioner`: Node resources mirroring the allocation record
//! - `controller`: pool state machine, reconciler and dispatch worker
//! - `store`: versioned object store (memory and SQLite backends)

pub mod allocation;
pub mod config;
pub mod controller;
pub mod error;
pub mod provisioner;
pub mod resources;
pub mod store;

pub use error::{HwMgrError, HwResult};
