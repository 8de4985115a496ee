//! Node provisioner: the externally visible Node resource for each assigned
//! node name.

use hwmgr_id::{GroupName, NodeName, PoolId, ProfileName};
use tracing::{error, info, instrument};

use crate::error::{HwMgrError, HwResult};
use crate::resources::{Node, NodeSpec, ObjectKey, ObjectMeta, Owner};
use crate::store::{Client, WriteMode};

/// Where a node goes: its pool, group and hardware profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement<'a> {
    pub pool_id: &'a PoolId,
    pub group: &'a GroupName,
    pub profile: &'a ProfileName,
    pub owner: Option<&'a Owner>,
}

impl Placement<'_> {
    fn node(&self, namespace: &str, name: &NodeName) -> Node {
        Node {
            metadata: ObjectMeta::new(namespace, name.as_str()),
            spec: NodeSpec {
                node_pool: self.pool_id.clone(),
                group_name: self.group.clone(),
                hw_profile: self.profile.clone(),
            },
        }
    }
}

/// Creates and deletes Node resources in the controller namespace.
#[derive(Clone)]
pub struct NodeProvisioner {
    client: Client,
    namespace: String,
}

impl NodeProvisioner {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, name: &NodeName) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), name.as_str())
    }

    /// Creates the Node. An existing Node of that name is a conflict.
    #[instrument(skip(self, placement), fields(pool = %placement.pool_id, group = %placement.group))]
    pub async fn create(&self, name: &NodeName, placement: &Placement<'_>) -> HwResult<Node> {
        let node = placement.node(&self.namespace, name);
        match self
            .client
            .create_or_update(&node, placement.owner, WriteMode::Create)
            .await
        {
            Ok(created) => {
                info!(node = %name, profile = %placement.profile, "Created node");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                error!(node = %name, "Node already exists");
                Err(HwMgrError::ResourceConflict {
                    node: name.clone(),
                    detail: "a Node with this name already exists".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the Node unless it already exists for the same pool and group.
    ///
    /// Returns true if a Node was created.
    pub async fn ensure(&self, name: &NodeName, placement: &Placement<'_>) -> HwResult<bool> {
        match self.get(name).await? {
            None => {
                self.create(name, placement).await?;
                Ok(true)
            }
            Some(existing)
                if &existing.spec.node_pool == placement.pool_id
                    && &existing.spec.group_name == placement.group =>
            {
                Ok(false)
            }
            Some(existing) => {
                error!(
                    node = %name,
                    claimed_by = %existing.spec.node_pool,
                    "Node belongs to another pool"
                );
                Err(HwMgrError::ResourceConflict {
                    node: name.clone(),
                    detail: format!(
                        "claimed by pool {} group {}",
                        existing.spec.node_pool, existing.spec.group_name
                    ),
                })
            }
        }
    }

    /// Deletes the Node. Returns false if it was already gone.
    pub async fn delete(&self, name: &NodeName) -> HwResult<bool> {
        let deleted = self.client.delete::<Node>(&self.key(name)).await?;
        if deleted {
            info!(node = %name, "Deleted node");
        }
        Ok(deleted)
    }

    pub async fn get(&self, name: &NodeName) -> HwResult<Option<Node>> {
        Ok(self.client.get_opt::<Node>(&self.key(name)).await?)
    }

    /// Nodes that claim `pool_id`, ordered by name.
    pub async fn list_for_pool(&self, pool_id: &PoolId) -> HwResult<Vec<Node>> {
        let nodes = self.client.list::<Node>(&self.namespace).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| &n.spec.node_pool == pool_id)
            .collect())
    }
}
