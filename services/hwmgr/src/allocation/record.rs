//! The allocation store: hardware catalog and allocation record persisted in
//! one versioned inventory record.

use std::collections::BTreeMap;

use hwmgr_id::{GroupName, NodeName, PoolId, ProfileName};
use hwmgr_reconcile::{retry_on_conflict, ReconcileError, RetryError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HwMgrError, HwResult};
use crate::resources::{
    InventoryRecord, ObjectKey, ALLOCATED_KEY, HWPROFILES_KEY, INVENTORY_RECORD_NAME,
};
use crate::store::{Client, StoreError, WriteMode};

/// A named set of interchangeable physical nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub name: ProfileName,
    #[serde(default)]
    pub nodes: Vec<NodeName>,
}

/// The static hardware catalog (`hwprofiles` section).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCatalog {
    #[serde(default)]
    pub profiles: Vec<HardwareProfile>,
}

impl HardwareCatalog {
    pub fn new(profiles: Vec<HardwareProfile>) -> Self {
        Self { profiles }
    }

    /// Parses a catalog in the `hwprofiles` section format.
    pub fn from_yaml(text: &str) -> HwResult<Self> {
        serde_yaml::from_str(text).map_err(|source| HwMgrError::InvalidRecord {
            section: HWPROFILES_KEY,
            source,
        })
    }

    /// Declared nodes of `profile`, in catalog order.
    pub fn nodes<'a>(
        &'a self,
        profile: &'a ProfileName,
    ) -> impl Iterator<Item = &'a NodeName> + 'a {
        self.profiles
            .iter()
            .filter(move |p| &p.name == profile)
            .flat_map(|p| p.nodes.iter())
    }

    /// Profile that declares `node`, if any.
    pub fn profile_of(&self, node: &NodeName) -> Option<&ProfileName> {
        self.profiles
            .iter()
            .find(|p| p.nodes.contains(node))
            .map(|p| &p.name)
    }
}

/// Per-group node assignments of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPool {
    #[serde(rename = "cloudID")]
    pub cloud_id: PoolId,
    #[serde(default)]
    pub nodegroups: BTreeMap<GroupName, Vec<NodeName>>,
}

/// Which node belongs to which pool and group (`allocated` section).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    #[serde(default)]
    pub clouds: Vec<AllocatedPool>,
}

impl AllocationRecord {
    pub fn pool(&self, pool_id: &PoolId) -> Option<&AllocatedPool> {
        self.clouds.iter().find(|c| &c.cloud_id == pool_id)
    }

    /// The pool's entry, created empty if absent.
    pub fn pool_entry(&mut self, pool_id: &PoolId) -> &mut AllocatedPool {
        let index = match self.clouds.iter().position(|c| &c.cloud_id == pool_id) {
            Some(index) => index,
            None => {
                self.clouds.push(AllocatedPool {
                    cloud_id: pool_id.clone(),
                    nodegroups: BTreeMap::new(),
                });
                self.clouds.len() - 1
            }
        };
        &mut self.clouds[index]
    }

    pub fn remove_pool(&mut self, pool_id: &PoolId) -> Option<AllocatedPool> {
        let index = self.clouds.iter().position(|c| &c.cloud_id == pool_id)?;
        Some(self.clouds.remove(index))
    }

    /// Nodes assigned to one group of a pool, in assignment order.
    pub fn assigned(&self, pool_id: &PoolId, group: &GroupName) -> &[NodeName] {
        self.pool(pool_id)
            .and_then(|p| p.nodegroups.get(group))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every assigned node, across all pools and groups.
    pub fn all_assigned(&self) -> impl Iterator<Item = &NodeName> {
        self.clouds
            .iter()
            .flat_map(|c| c.nodegroups.values())
            .flatten()
    }

    /// Every `(group, node)` assignment of a pool.
    pub fn pool_assignments(&self, pool_id: &PoolId) -> Vec<(GroupName, NodeName)> {
        self.pool(pool_id)
            .map(|p| {
                p.nodegroups
                    .iter()
                    .flat_map(|(g, nodes)| nodes.iter().map(|n| (g.clone(), n.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A parsed snapshot of the inventory record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub catalog: HardwareCatalog,
    pub allocations: AllocationRecord,
}

impl Inventory {
    /// Parses both sections. A missing or blank section is empty; a malformed
    /// one is an error.
    pub fn parse(record: &InventoryRecord) -> HwResult<Self> {
        Ok(Self {
            catalog: section(record, HWPROFILES_KEY)?,
            allocations: section(record, ALLOCATED_KEY)?,
        })
    }
}

fn section<T: DeserializeOwned + Default>(
    record: &InventoryRecord,
    key: &'static str,
) -> HwResult<T> {
    match record.data.get(key) {
        Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text)
            .map_err(|source| HwMgrError::InvalidRecord { section: key, source }),
        _ => Ok(T::default()),
    }
}

fn render<T: Serialize>(value: &T, key: &'static str) -> HwResult<String> {
    serde_yaml::to_string(value).map_err(|source| HwMgrError::InvalidRecord { section: key, source })
}

/// Outcome of a mutation closure passed to [`AllocationStore::mutate`].
#[derive(Debug)]
pub enum Mutation<T> {
    /// Persist the modified record, then return the value.
    Commit(T),
    /// Return the value without writing.
    Skip(T),
}

/// Durable access to the inventory record.
#[derive(Clone)]
pub struct AllocationStore {
    client: Client,
    key: ObjectKey,
}

impl AllocationStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            key: ObjectKey::new(namespace, INVENTORY_RECORD_NAME),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn load(&self) -> HwResult<Inventory> {
        let record = self.client.get::<InventoryRecord>(&self.key).await?;
        Inventory::parse(&record)
    }

    /// Read-modify-write of the allocation record.
    ///
    /// `f` sees a fresh record on every attempt and decides again after a
    /// conflict. Conflict retries are bounded by the client's retry policy.
    pub async fn mutate<T, F>(&self, f: F) -> HwResult<T>
    where
        F: Fn(&HardwareCatalog, &mut AllocationRecord) -> HwResult<Mutation<T>>,
    {
        let f = &f;
        retry_on_conflict(
            self.client.retry_policy(),
            HwMgrError::is_conflict,
            move || async move { self.try_mutate(f).await },
        )
        .await
        .map_err(|e| self.retry_failure(e))
    }

    async fn try_mutate<T, F>(&self, f: &F) -> HwResult<T>
    where
        F: Fn(&HardwareCatalog, &mut AllocationRecord) -> HwResult<Mutation<T>>,
    {
        let mut record = self.client.get::<InventoryRecord>(&self.key).await?;
        let Inventory {
            catalog,
            mut allocations,
        } = Inventory::parse(&record)?;

        match f(&catalog, &mut allocations)? {
            Mutation::Skip(value) => Ok(value),
            Mutation::Commit(value) => {
                record
                    .data
                    .insert(ALLOCATED_KEY.to_string(), render(&allocations, ALLOCATED_KEY)?);
                let written = self.client.update(&record).await?;
                debug!(
                    resource_version = written.metadata.resource_version,
                    "Allocation record committed"
                );
                Ok(value)
            }
        }
    }

    /// Replaces the hardware catalog, creating the record if needed. The
    /// allocation section is kept.
    pub async fn save_catalog(&self, catalog: &HardwareCatalog) -> HwResult<()> {
        let mut patch = InventoryRecord::new(self.key.namespace.clone());
        patch
            .data
            .insert(HWPROFILES_KEY.to_string(), render(catalog, HWPROFILES_KEY)?);
        let patch = &patch;

        retry_on_conflict(
            self.client.retry_policy(),
            HwMgrError::is_conflict,
            move || async move {
                self.client
                    .create_or_update(patch, None, WriteMode::Patch)
                    .await
                    .map_err(HwMgrError::from)
            },
        )
        .await
        .map_err(|e| self.retry_failure(e))?;

        info!(profiles = catalog.profiles.len(), "Hardware catalog saved");
        Ok(())
    }

    fn retry_failure(&self, err: RetryError<HwMgrError>) -> HwMgrError {
        match err {
            RetryError::Failed(e) => e,
            RetryError::Exhausted { attempts, .. } => {
                HwMgrError::StoreUnavailable(StoreError::Reconcile(
                    ReconcileError::ConflictRetriesExhausted {
                        resource: self.key.to_string(),
                        attempts,
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use hwmgr_reconcile::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn catalog() -> HardwareCatalog {
        HardwareCatalog::new(vec![HardwareProfile {
            name: "edge-profile".parse().unwrap(),
            nodes: vec!["n1".parse().unwrap(), "n2".parse().unwrap()],
        }])
    }

    async fn store() -> (Arc<MemoryStore>, AllocationStore) {
        let memory = Arc::new(MemoryStore::new());
        let client = Client::new(memory.clone()).with_retry_policy(RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        });
        let store = AllocationStore::new(client, "hwmgr");
        store.save_catalog(&catalog()).await.unwrap();
        (memory, store)
    }

    #[test]
    fn test_parse_sections() {
        let mut record = InventoryRecord::new("hwmgr");
        record.data.insert(
            HWPROFILES_KEY.to_string(),
            "profiles:\n  - name: edge-profile\n    nodes: [n1, n2]\n".to_string(),
        );
        record.data.insert(
            ALLOCATED_KEY.to_string(),
            "clouds:\n  - cloudID: p1\n    nodegroups:\n      g1: [n1]\n".to_string(),
        );

        let inventory = Inventory::parse(&record).unwrap();
        assert_eq!(inventory.catalog, catalog());
        let p1: PoolId = "p1".parse().unwrap();
        let g1: GroupName = "g1".parse().unwrap();
        assert_eq!(inventory.allocations.assigned(&p1, &g1).len(), 1);
    }

    #[test]
    fn test_catalog_keeps_names_as_written() {
        let catalog = HardwareCatalog::from_yaml(
            "profiles:\n  - name: profile-spr-single-processor-64G\n    nodes: [Node_A, node-b]\n",
        )
        .unwrap();
        let profile: ProfileName = "profile-spr-single-processor-64G".parse().unwrap();
        let nodes: Vec<&str> = catalog.nodes(&profile).map(|n| n.as_str()).collect();
        assert_eq!(nodes, vec!["Node_A", "node-b"]);
        assert_eq!(
            catalog.profile_of(&"Node_A".parse().unwrap()),
            Some(&profile)
        );
    }

    #[test]
    fn test_missing_allocated_section_is_empty() {
        let mut record = InventoryRecord::new("hwmgr");
        record.data.insert(ALLOCATED_KEY.to_string(), "  \n".to_string());
        let inventory = Inventory::parse(&record).unwrap();
        assert!(inventory.allocations.clouds.is_empty());
    }

    #[test]
    fn test_malformed_allocated_section_is_error() {
        let mut record = InventoryRecord::new("hwmgr");
        record
            .data
            .insert(ALLOCATED_KEY.to_string(), "clouds: {not: [a list".to_string());
        let err = Inventory::parse(&record).unwrap_err();
        assert!(matches!(
            err,
            HwMgrError::InvalidRecord {
                section: ALLOCATED_KEY,
                ..
            }
        ));
    }

    #[test]
    fn test_pool_entry_and_remove() {
        let mut record = AllocationRecord::default();
        let p1: PoolId = "p1".parse().unwrap();
        let g1: GroupName = "g1".parse().unwrap();

        record
            .pool_entry(&p1)
            .nodegroups
            .entry(g1.clone())
            .or_default()
            .push("n1".parse().unwrap());
        assert_eq!(record.all_assigned().count(), 1);
        assert_eq!(record.pool_assignments(&p1).len(), 1);

        assert!(record.remove_pool(&p1).is_some());
        assert!(record.remove_pool(&p1).is_none());
        assert!(record.assigned(&p1, &g1).is_empty());
    }

    #[tokio::test]
    async fn test_mutate_commits_and_skips() {
        let (memory, store) = store().await;
        let writes = memory.write_count("ConfigMap");
        let p1: PoolId = "p1".parse().unwrap();

        store
            .mutate(|_, record| {
                record.pool_entry(&p1);
                Ok(Mutation::Commit(()))
            })
            .await
            .unwrap();
        assert_eq!(memory.write_count("ConfigMap"), writes + 1);

        store
            .mutate(|_, _| Ok(Mutation::Skip(())))
            .await
            .unwrap();
        assert_eq!(memory.write_count("ConfigMap"), writes + 1);

        let inventory = store.load().await.unwrap();
        assert!(inventory.allocations.pool(&p1).is_some());
        assert_eq!(inventory.catalog, catalog());
    }

    #[tokio::test]
    async fn test_mutate_retries_then_gives_up() {
        let (memory, store) = store().await;

        memory.inject_conflicts("ConfigMap", 2);
        store
            .mutate(|_, _| Ok(Mutation::Commit(())))
            .await
            .unwrap();

        memory.inject_conflicts("ConfigMap", 10);
        let err = store
            .mutate(|_, _| Ok(Mutation::Commit(())))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HwMgrError::StoreUnavailable(StoreError::Reconcile(
                ReconcileError::ConflictRetriesExhausted { attempts: 3, .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_save_catalog_keeps_allocations() {
        let (_, store) = store().await;
        let p1: PoolId = "p1".parse().unwrap();
        store
            .mutate(|_, record| {
                record.pool_entry(&p1);
                Ok(Mutation::Commit(()))
            })
            .await
            .unwrap();

        let mut bigger = catalog();
        bigger.profiles[0].nodes.push("n3".parse().unwrap());
        store.save_catalog(&bigger).await.unwrap();

        let inventory = store.load().await.unwrap();
        assert_eq!(inventory.catalog, bigger);
        assert!(inventory.allocations.pool(&p1).is_some());
    }

    #[tokio::test]
    async fn test_load_missing_record_is_not_found() {
        let memory = Arc::new(MemoryStore::new());
        let store = AllocationStore::new(Client::new(memory), "hwmgr");
        assert!(matches!(
            store.load().await.unwrap_err(),
            HwMgrError::NotFound(_)
        ));
    }
}
