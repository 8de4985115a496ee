//! Resource types kept in the object store.
//!
//! - `NodePool`: requester-owned spec, controller-owned status
//! - `Node`: one per allocated node, owned by its pool
//! - `InventoryRecord`: hardware catalog plus allocation record

mod inventory;
mod meta;
mod node;
mod node_pool;

pub use inventory::{InventoryRecord, ALLOCATED_KEY, HWPROFILES_KEY, INVENTORY_RECORD_NAME};
pub use meta::{ObjectKey, ObjectMeta, Owner, OwnerReference, Resource};
pub use node::{Node, NodeSpec};
pub use node_pool::{
    Condition, ConditionReason, ConditionType, NodeGroup, NodePool, NodePoolProperties,
    NodePoolSpec, NodePoolStatus, PoolRequest, NODE_ALLOCATION_FINALIZER,
};
