//! NodePool: a request for N nodes per named group.

use chrono::{DateTime, Utc};
use hwmgr_id::{GroupName, NodeName, PoolId, ProfileName};
use hwmgr_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use super::meta::{ObjectMeta, Owner, Resource};

/// Finalizer the controller keeps on every admitted pool until its nodes are
/// released.
pub const NODE_ALLOCATION_FINALIZER: &str = "hwmgr.io/node-allocation";

/// A node pool request as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub metadata: ObjectMeta,
    pub spec: NodePoolSpec,
    #[serde(default)]
    pub status: NodePoolStatus,
}

impl Resource for NodePool {
    const KIND: &'static str = "NodePool";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Desired state of a node pool. Owned by the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    #[serde(rename = "cloudID")]
    pub cloud_id: PoolId,

    #[serde(default)]
    pub node_group: Vec<NodeGroup>,
}

/// One named group of interchangeable nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub name: GroupName,
    pub hw_profile: ProfileName,
    pub size: u32,
}

impl NodeGroup {
    pub fn new(name: GroupName, hw_profile: ProfileName, size: u32) -> Self {
        Self {
            name,
            hw_profile,
            size,
        }
    }
}

/// Observed state of a node pool. Owned by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub properties: NodePoolProperties,

    /// Hash of the spec last admitted or provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_spec_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolProperties {
    /// All nodes assigned to the pool, sorted.
    #[serde(default)]
    pub node_names: Vec<NodeName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Failed,
    Unprovisioned,
    Provisioned,
    Updating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    InProgress,
    Completed,
    Failed,
    SpecChanged,
}

/// A typed, timestamped boolean status entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: bool,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// The allocation-relevant view of a pool: what the engine works from.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolRequest {
    pub pool_id: PoolId,
    pub groups: Vec<NodeGroup>,
    /// Owner recorded on created nodes.
    pub owner: Option<Owner>,
}

impl PoolRequest {
    pub fn new(pool_id: PoolId, groups: Vec<NodeGroup>) -> Self {
        Self {
            pool_id,
            groups,
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn group(&self, name: &GroupName) -> Option<&NodeGroup> {
        self.groups.iter().find(|g| &g.name == name)
    }
}

impl NodePool {
    pub fn new(metadata: ObjectMeta, spec: NodePoolSpec) -> Self {
        Self {
            metadata,
            spec,
            status: NodePoolStatus::default(),
        }
    }

    pub fn request(&self) -> PoolRequest {
        PoolRequest::new(self.spec.cloud_id.clone(), self.spec.node_group.clone())
            .with_owner(self.as_owner())
    }

    pub fn spec_hash(&self) -> SpecHash {
        // NodePoolSpec only holds strings and integers.
        let value = serde_json::to_value(&self.spec).unwrap_or(serde_json::Value::Null);
        SpecHash::from_json(&value)
    }

    /// Returns true if the spec differs from the one last observed.
    pub fn spec_changed(&self) -> bool {
        match &self.status.observed_spec_hash {
            Some(observed) => !self.spec_hash().matches(observed),
            None => false,
        }
    }
}
