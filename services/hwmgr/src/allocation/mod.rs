//! Allocation core: the inventory record, free-node resolution, and the
//! engine that assigns nodes to pools.

mod engine;
mod record;
mod resolver;

pub use engine::{AllocationEngine, AllocationStep, AssignedNode, DriftReport};
pub use record::{
    AllocatedPool, AllocationRecord, AllocationStore, HardwareCatalog, HardwareProfile, Inventory,
    Mutation,
};
pub use resolver::free_nodes;
