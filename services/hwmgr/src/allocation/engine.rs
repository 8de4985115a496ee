//! Allocation engine: moves a pool's assignments toward its requested sizes,
//! one node per call.

use std::collections::BTreeSet;

use hwmgr_id::{GroupName, NodeName, PoolId, ProfileName};
use hwmgr_reconcile::ConvergenceStatus;
use tracing::{info, instrument, warn};

use super::record::{AllocationRecord, AllocationStore, HardwareCatalog, Mutation};
use super::resolver::free_nodes;
use crate::error::{HwMgrError, HwResult};
use crate::provisioner::{NodeProvisioner, Placement};
use crate::resources::{NodeGroup, PoolRequest};

/// A node assigned by one allocation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedNode {
    pub node: NodeName,
    pub group: GroupName,
    pub profile: ProfileName,
}

/// Outcome of [`AllocationEngine::ensure_capacity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationStep {
    /// The node assigned by this step, if any.
    pub assigned: Option<AssignedNode>,
    /// Whether any group is still short after this step.
    pub status: ConvergenceStatus,
}

/// Repairs made by [`AllocationEngine::recover_drift`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Nodes re-created because the record lists them but no Node existed.
    pub recreated: Vec<NodeName>,
    /// Nodes deleted because they claim the pool but the record does not list them.
    pub removed: Vec<NodeName>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.recreated.is_empty() && self.removed.is_empty()
    }
}

fn remaining(record: &AllocationRecord, pool_id: &PoolId, group: &NodeGroup) -> usize {
    (group.size as usize).saturating_sub(record.assigned(pool_id, &group.name).len())
}

fn insufficient(group: &NodeGroup, needed: usize, available: usize) -> HwMgrError {
    HwMgrError::InsufficientCapacity {
        profile: group.hw_profile.clone(),
        needed,
        available,
    }
}

/// Checks a short group against the current free nodes.
fn check_capacity(
    catalog: &HardwareCatalog,
    record: &AllocationRecord,
    group: &NodeGroup,
    needed: usize,
) -> HwResult<Vec<NodeName>> {
    let free = free_nodes(catalog, record, &group.hw_profile);
    if free.len() < needed {
        return Err(insufficient(group, needed, free.len()));
    }
    Ok(free)
}

/// Owns the allocation record and the Nodes that mirror it.
#[derive(Clone)]
pub struct AllocationEngine {
    store: AllocationStore,
    provisioner: NodeProvisioner,
}

impl AllocationEngine {
    pub fn new(store: AllocationStore, provisioner: NodeProvisioner) -> Self {
        Self { store, provisioner }
    }

    pub fn store(&self) -> &AllocationStore {
        &self.store
    }

    pub fn provisioner(&self) -> &NodeProvisioner {
        &self.provisioner
    }

    /// Assigns one free node to the first short group and creates its Node.
    ///
    /// The record is committed before the Node is created. A satisfied pool
    /// writes nothing.
    #[instrument(skip(self, request), fields(pool = %request.pool_id))]
    pub async fn ensure_capacity(&self, request: &PoolRequest) -> HwResult<AllocationStep> {
        let (assigned, status) = self
            .store
            .mutate(|catalog, record| {
                let Some((group, needed)) = request
                    .groups
                    .iter()
                    .map(|g| (g, remaining(record, &request.pool_id, g)))
                    .find(|(_, needed)| *needed > 0)
                else {
                    return Ok(Mutation::Skip((None, ConvergenceStatus::Converged)));
                };

                let free = check_capacity(catalog, record, group, needed)?;
                let node = free[0].clone();
                record
                    .pool_entry(&request.pool_id)
                    .nodegroups
                    .entry(group.name.clone())
                    .or_default()
                    .push(node.clone());

                let still_short = request
                    .groups
                    .iter()
                    .any(|g| remaining(record, &request.pool_id, g) > 0);
                let status = if still_short {
                    ConvergenceStatus::Converging
                } else {
                    ConvergenceStatus::Converged
                };

                Ok(Mutation::Commit((
                    Some(AssignedNode {
                        node,
                        group: group.name.clone(),
                        profile: group.hw_profile.clone(),
                    }),
                    status,
                )))
            })
            .await?;

        if let Some(assigned) = &assigned {
            info!(
                node = %assigned.node,
                group = %assigned.group,
                profile = %assigned.profile,
                "Allocated node"
            );
            let placement = Placement {
                pool_id: &request.pool_id,
                group: &assigned.group,
                profile: &assigned.profile,
                owner: request.owner.as_ref(),
            };
            self.provisioner.create(&assigned.node, &placement).await?;
        }

        Ok(AllocationStep { assigned, status })
    }

    /// Checks that every group fits into the currently free nodes of its
    /// profile, each group considered on its own.
    #[instrument(skip(self, request), fields(pool = %request.pool_id))]
    pub async fn validate_request(&self, request: &PoolRequest) -> HwResult<()> {
        let inventory = self.store.load().await?;
        for group in &request.groups {
            check_capacity(
                &inventory.catalog,
                &inventory.allocations,
                group,
                group.size as usize,
            )?;
        }
        Ok(())
    }

    /// Returns true once every group has its requested size.
    ///
    /// A short group whose profile no longer has enough free nodes is an
    /// `InsufficientCapacity` error.
    pub async fn is_fully_satisfied(&self, request: &PoolRequest) -> HwResult<bool> {
        let inventory = self.store.load().await?;
        for group in &request.groups {
            let needed = remaining(&inventory.allocations, &request.pool_id, group);
            if needed == 0 {
                continue;
            }
            check_capacity(&inventory.catalog, &inventory.allocations, group, needed)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Assigned nodes of the pool's requested groups, sorted.
    pub async fn allocated_nodes(&self, request: &PoolRequest) -> HwResult<Vec<NodeName>> {
        let inventory = self.store.load().await?;
        let mut nodes: Vec<NodeName> = request
            .groups
            .iter()
            .flat_map(|g| inventory.allocations.assigned(&request.pool_id, &g.name))
            .cloned()
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    /// Deletes the pool's Nodes and drops its record entry.
    ///
    /// Returns the number of Nodes deleted. Releasing an unknown pool is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn release(&self, pool_id: &PoolId) -> HwResult<usize> {
        let inventory = self.store.load().await?;
        let mut targets: BTreeSet<NodeName> = inventory
            .allocations
            .pool_assignments(pool_id)
            .into_iter()
            .map(|(_, node)| node)
            .collect();
        targets.extend(
            self.provisioner
                .list_for_pool(pool_id)
                .await?
                .into_iter()
                .filter_map(|n| n.metadata.name.parse::<NodeName>().ok()),
        );

        let mut deleted = 0;
        for node in &targets {
            if self.provisioner.delete(node).await? {
                deleted += 1;
            }
        }

        let removed = self
            .store
            .mutate(|_, record| {
                Ok(match record.remove_pool(pool_id) {
                    Some(_) => Mutation::Commit(true),
                    None => Mutation::Skip(false),
                })
            })
            .await?;

        if removed || deleted > 0 {
            info!(nodes = deleted, "Released pool allocation");
        }
        Ok(deleted)
    }

    /// Removes one surplus node from the pool.
    ///
    /// A node declared under a different profile than its group now requests
    /// goes first. After that, requested groups above their size are checked
    /// in request order, then groups no longer requested. The record is
    /// committed before the Node is deleted.
    #[instrument(skip(self, request), fields(pool = %request.pool_id))]
    pub async fn trim_excess(&self, request: &PoolRequest) -> HwResult<Option<NodeName>> {
        let trimmed = self
            .store
            .mutate(|catalog, record| {
                let Some(entry) = record.pool(&request.pool_id) else {
                    return Ok(Mutation::Skip(None));
                };

                let wrong_profile = request.groups.iter().find_map(|g| {
                    record
                        .assigned(&request.pool_id, &g.name)
                        .iter()
                        .find(|node| {
                            catalog
                                .profile_of(node)
                                .is_some_and(|profile| profile != &g.hw_profile)
                        })
                        .map(|node| (g.name.clone(), Some(node.clone())))
                });

                let over_full = || {
                    let requested =
                        request.groups.iter().map(|g| (g.name.clone(), g.size as usize));
                    let dropped = entry
                        .nodegroups
                        .keys()
                        .filter(|name| request.group(name).is_none())
                        .map(|name| (name.clone(), 0));
                    requested
                        .chain(dropped)
                        .find(|(name, size)| record.assigned(&request.pool_id, name).len() > *size)
                        .map(|(name, _)| (name, None))
                };

                let Some((group, target)) = wrong_profile.or_else(over_full) else {
                    return Ok(Mutation::Skip(None));
                };

                let groups = &mut record.pool_entry(&request.pool_id).nodegroups;
                let node = groups.get_mut(&group).and_then(|nodes| match target {
                    Some(target) => {
                        let at = nodes.iter().position(|n| n == &target)?;
                        Some(nodes.remove(at))
                    }
                    None => nodes.pop(),
                });
                if groups.get(&group).is_some_and(Vec::is_empty) {
                    groups.remove(&group);
                }
                Ok(match node {
                    Some(node) => Mutation::Commit(Some((group, node))),
                    None => Mutation::Skip(None),
                })
            })
            .await?;

        let Some((group, node)) = trimmed else {
            return Ok(None);
        };
        info!(node = %node, group = %group, "Trimmed surplus node");
        self.provisioner.delete(&node).await?;
        Ok(Some(node))
    }

    /// Makes the pool's Nodes match the record: re-creates missing Nodes and
    /// deletes Nodes the record does not list.
    #[instrument(skip(self, request), fields(pool = %request.pool_id))]
    pub async fn recover_drift(&self, request: &PoolRequest) -> HwResult<DriftReport> {
        let inventory = self.store.load().await?;
        let assignments = inventory.allocations.pool_assignments(&request.pool_id);
        let existing = self.provisioner.list_for_pool(&request.pool_id).await?;
        let mut report = DriftReport::default();

        let existing_names: BTreeSet<&str> =
            existing.iter().map(|n| n.metadata.name.as_str()).collect();
        for (group, node) in &assignments {
            if existing_names.contains(node.as_str()) {
                continue;
            }
            let profile = request
                .group(group)
                .map(|g| &g.hw_profile)
                .or_else(|| inventory.catalog.profile_of(node));
            let Some(profile) = profile else {
                warn!(node = %node, group = %group, "No profile known for assigned node; skipping");
                continue;
            };

            let placement = Placement {
                pool_id: &request.pool_id,
                group,
                profile,
                owner: request.owner.as_ref(),
            };
            if self.provisioner.ensure(node, &placement).await? {
                warn!(node = %node, group = %group, "Re-created missing node");
                report.recreated.push(node.clone());
            }
        }

        let recorded: BTreeSet<&NodeName> = assignments.iter().map(|(_, n)| n).collect();
        for node in &existing {
            let Ok(name) = node.metadata.name.parse::<NodeName>() else {
                continue;
            };
            if recorded.contains(&name) {
                continue;
            }
            if self.provisioner.delete(&name).await? {
                warn!(node = %name, "Deleted node missing from allocation record");
                report.removed.push(name);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::record::HardwareProfile;
    use crate::store::{Client, MemoryStore};
    use std::sync::Arc;

    struct Harness {
        memory: Arc<MemoryStore>,
        engine: AllocationEngine,
    }

    async fn harness(nodes: &[&str]) -> Harness {
        let memory = Arc::new(MemoryStore::new());
        let client = Client::new(memory.clone());
        let store = AllocationStore::new(client.clone(), "hwmgr");
        store
            .save_catalog(&HardwareCatalog::new(vec![HardwareProfile {
                name: "edge-profile".parse().unwrap(),
                nodes: nodes.iter().map(|n| n.parse().unwrap()).collect(),
            }]))
            .await
            .unwrap();
        let engine = AllocationEngine::new(store, NodeProvisioner::new(client, "hwmgr"));
        Harness { memory, engine }
    }

    fn request(pool: &str, groups: &[(&str, u32)]) -> PoolRequest {
        PoolRequest::new(
            pool.parse().unwrap(),
            groups
                .iter()
                .map(|(name, size)| {
                    NodeGroup::new(name.parse().unwrap(), "edge-profile".parse().unwrap(), *size)
                })
                .collect(),
        )
    }

    fn node(name: &str) -> NodeName {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn test_one_node_per_call_in_declared_order() {
        let h = harness(&["n1", "n2", "n3"]).await;
        let req = request("p1", &[("g1", 2)]);

        let step = h.engine.ensure_capacity(&req).await.unwrap();
        assert_eq!(step.assigned.unwrap().node, node("n1"));
        assert!(step.status.is_converging());
        assert!(!h.engine.is_fully_satisfied(&req).await.unwrap());

        let step = h.engine.ensure_capacity(&req).await.unwrap();
        assert_eq!(step.assigned.unwrap().node, node("n2"));
        assert!(step.status.is_converged());
        assert!(h.engine.is_fully_satisfied(&req).await.unwrap());

        assert_eq!(
            h.engine.allocated_nodes(&req).await.unwrap(),
            vec![node("n1"), node("n2")]
        );
    }

    #[tokio::test]
    async fn test_satisfied_pool_writes_nothing() {
        let h = harness(&["n1"]).await;
        let req = request("p1", &[("g1", 1)]);
        h.engine.ensure_capacity(&req).await.unwrap();

        let record_writes = h.memory.write_count("ConfigMap");
        let node_writes = h.memory.write_count("Node");
        let step = h.engine.ensure_capacity(&req).await.unwrap();
        assert!(step.assigned.is_none());
        assert!(step.status.is_converged());
        assert_eq!(h.memory.write_count("ConfigMap"), record_writes);
        assert_eq!(h.memory.write_count("Node"), node_writes);
    }

    #[tokio::test]
    async fn test_insufficient_capacity_reports_remaining() {
        let h = harness(&["n1"]).await;
        let req = request("p1", &[("g1", 2)]);

        let err = h.engine.validate_request(&req).await.unwrap_err();
        assert!(matches!(
            err,
            HwMgrError::InsufficientCapacity {
                needed: 2,
                available: 1,
                ..
            }
        ));

        let err = h.engine.ensure_capacity(&req).await.unwrap_err();
        assert!(err.is_insufficient_capacity());
        assert!(h.engine.allocated_nodes(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_group_filled_after_first() {
        let h = harness(&["n1", "n2", "n3"]).await;
        let req = request("p1", &[("masters", 1), ("workers", 1)]);

        let first = h.engine.ensure_capacity(&req).await.unwrap();
        assert_eq!(first.assigned.unwrap().group.as_str(), "masters");
        let second = h.engine.ensure_capacity(&req).await.unwrap();
        let second = second.assigned.unwrap();
        assert_eq!(second.group.as_str(), "workers");
        assert_eq!(second.node, node("n2"));
    }

    #[tokio::test]
    async fn test_release_is_complete_and_idempotent() {
        let h = harness(&["n1", "n2"]).await;
        let req = request("p1", &[("g1", 2)]);
        h.engine.ensure_capacity(&req).await.unwrap();
        h.engine.ensure_capacity(&req).await.unwrap();

        assert_eq!(h.engine.release(&req.pool_id).await.unwrap(), 2);
        assert!(h.engine.allocated_nodes(&req).await.unwrap().is_empty());
        assert!(h
            .engine
            .provisioner()
            .list_for_pool(&req.pool_id)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(h.engine.release(&req.pool_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trim_excess_removes_last_assigned() {
        let h = harness(&["n1", "n2", "n3"]).await;
        let big = request("p1", &[("g1", 3)]);
        for _ in 0..3 {
            h.engine.ensure_capacity(&big).await.unwrap();
        }

        let small = request("p1", &[("g1", 1)]);
        assert_eq!(h.engine.trim_excess(&small).await.unwrap(), Some(node("n3")));
        assert_eq!(h.engine.trim_excess(&small).await.unwrap(), Some(node("n2")));
        assert_eq!(h.engine.trim_excess(&small).await.unwrap(), None);
        assert_eq!(
            h.engine.allocated_nodes(&small).await.unwrap(),
            vec![node("n1")]
        );
        assert!(h.engine.provisioner().get(&node("n3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trim_excess_drops_removed_group() {
        let h = harness(&["n1", "n2"]).await;
        let before = request("p1", &[("g1", 1), ("old", 1)]);
        h.engine.ensure_capacity(&before).await.unwrap();
        h.engine.ensure_capacity(&before).await.unwrap();

        let after = request("p1", &[("g1", 1)]);
        assert_eq!(h.engine.trim_excess(&after).await.unwrap(), Some(node("n2")));
        let inventory = h.engine.store().load().await.unwrap();
        let entry = inventory.allocations.pool(&after.pool_id).unwrap();
        assert!(!entry.nodegroups.contains_key(&"old".parse::<GroupName>().unwrap()));
    }

    #[tokio::test]
    async fn test_trim_excess_prefers_nodes_of_replaced_profile() {
        let h = harness(&["n1", "n2"]).await;
        h.engine
            .store()
            .save_catalog(&HardwareCatalog::new(vec![
                HardwareProfile {
                    name: "edge-profile".parse().unwrap(),
                    nodes: vec![node("n1"), node("n2")],
                },
                HardwareProfile {
                    name: "core-profile".parse().unwrap(),
                    nodes: vec![node("c1")],
                },
            ]))
            .await
            .unwrap();
        let edge = request("p1", &[("g1", 2)]);
        h.engine.ensure_capacity(&edge).await.unwrap();
        h.engine.ensure_capacity(&edge).await.unwrap();

        let mut core = request("p1", &[("g1", 2)]);
        core.groups[0].hw_profile = "core-profile".parse().unwrap();
        assert_eq!(h.engine.trim_excess(&core).await.unwrap(), Some(node("n1")));
        assert_eq!(h.engine.trim_excess(&core).await.unwrap(), Some(node("n2")));
        assert_eq!(h.engine.trim_excess(&core).await.unwrap(), None);

        let step = h.engine.ensure_capacity(&core).await.unwrap();
        assert_eq!(step.assigned.unwrap().node, node("c1"));
        let err = h.engine.is_fully_satisfied(&core).await.unwrap_err();
        assert!(err.is_insufficient_capacity());
    }

    #[tokio::test]
    async fn test_shrunk_catalog_is_insufficient_for_short_group() {
        let h = harness(&["n1", "n2"]).await;
        let req = request("p1", &[("g1", 2)]);
        h.engine.ensure_capacity(&req).await.unwrap();
        assert!(!h.engine.is_fully_satisfied(&req).await.unwrap());

        h.engine
            .store()
            .save_catalog(&HardwareCatalog::new(vec![HardwareProfile {
                name: "edge-profile".parse().unwrap(),
                nodes: vec![node("n1")],
            }]))
            .await
            .unwrap();

        let err = h.engine.is_fully_satisfied(&req).await.unwrap_err();
        assert!(matches!(
            err,
            HwMgrError::InsufficientCapacity {
                needed: 1,
                available: 0,
                ..
            }
        ));
        assert_eq!(h.engine.allocated_nodes(&req).await.unwrap(), vec![node("n1")]);
    }

    #[tokio::test]
    async fn test_recover_drift_recreates_and_removes() {
        let h = harness(&["n1", "n2"]).await;
        let req = request("p1", &[("g1", 1)]);
        h.engine.ensure_capacity(&req).await.unwrap();

        // Node lost after the record was committed.
        h.engine.provisioner().delete(&node("n1")).await.unwrap();
        // Node claiming the pool that the record never listed.
        let placement = Placement {
            pool_id: &req.pool_id,
            group: &req.groups[0].name,
            profile: &req.groups[0].hw_profile,
            owner: None,
        };
        h.engine
            .provisioner()
            .create(&node("n2"), &placement)
            .await
            .unwrap();

        let report = h.engine.recover_drift(&req).await.unwrap();
        assert_eq!(report.recreated, vec![node("n1")]);
        assert_eq!(report.removed, vec![node("n2")]);

        assert!(h.engine.recover_drift(&req).await.unwrap().is_clean());
    }
}
