//! Node: the externally visible resource for one allocated node.

use hwmgr_id::{GroupName, PoolId, ProfileName};
use serde::{Deserialize, Serialize};

use super::meta::{ObjectMeta, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub spec: NodeSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub node_pool: PoolId,
    pub group_name: GroupName,
    pub hw_profile: ProfileName,
}

impl Resource for Node {
    const KIND: &'static str = "Node";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
