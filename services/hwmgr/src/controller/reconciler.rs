//! NodePool reconciler.
//!
//! One call performs at most one unit of work for one pool:
//! - admission of a new request
//! - one allocation or trim step
//! - release of a deleted pool
//! - drift repair of a provisioned pool
//!
//! It then reports when it wants to be called again.

use chrono::Utc;
use hwmgr_reconcile::Requeue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::state::{apply_state, next, Action, PoolEvent, PoolState};
use crate::allocation::AllocationEngine;
use crate::error::HwMgrError;
use crate::resources::{NodePool, ObjectKey, PoolRequest, NODE_ALLOCATION_FINALIZER};
use crate::store::{Client, StoreError};

/// A reconciliation that could not complete, with the requested retry delay.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ReconcileFailure {
    #[source]
    pub source: HwMgrError,
    /// `Requeue::done()` leaves the delay to the dispatcher's backoff.
    pub requeue: Requeue,
}

impl ReconcileFailure {
    fn new(source: HwMgrError) -> Self {
        Self {
            source,
            requeue: Requeue::done(),
        }
    }

    fn status_write(source: StoreError) -> Self {
        Self {
            source: source.into(),
            requeue: Requeue::medium(),
        }
    }
}

impl From<HwMgrError> for ReconcileFailure {
    fn from(source: HwMgrError) -> Self {
        Self::new(source)
    }
}

impl From<StoreError> for ReconcileFailure {
    fn from(source: StoreError) -> Self {
        Self::new(source.into())
    }
}

pub type ReconcileResult = Result<Requeue, ReconcileFailure>;

/// Drives NodePools through admission, allocation and release.
#[derive(Clone)]
pub struct NodePoolReconciler {
    client: Client,
    engine: AllocationEngine,
}

impl NodePoolReconciler {
    pub fn new(client: Client, engine: AllocationEngine) -> Self {
        Self { client, engine }
    }

    pub fn engine(&self) -> &AllocationEngine {
        &self.engine
    }

    /// Reconciles the NodePool at `key`.
    #[instrument(skip(self), fields(pool = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(pool) = self.client.get_opt::<NodePool>(key).await? else {
            debug!("NodePool not found; nothing to do");
            return Ok(Requeue::done());
        };

        let state = PoolState::from_conditions(&pool.status.conditions);
        let event = if pool.metadata.is_deleting() {
            PoolEvent::DeletionRequested
        } else if pool.spec_changed() {
            PoolEvent::SpecChanged
        } else {
            PoolEvent::Observed
        };
        let (target, action) = next(state, event);
        debug!(?state, ?event, ?action, "Determined action");

        match action {
            Action::None => Ok(Requeue::done()),
            Action::Release => self.release(pool).await,
            Action::Repair => self.repair(&pool).await,
            Action::Admit => {
                let pool = self.ensure_finalizer(pool).await?;
                self.admit(pool).await
            }
            Action::Progress => {
                let mut pool = self.ensure_finalizer(pool).await?;
                if target != state {
                    pool = self.enter_updating(pool).await?;
                }
                self.progress(pool, target).await
            }
        }
    }

    async fn ensure_finalizer(&self, mut pool: NodePool) -> Result<NodePool, ReconcileFailure> {
        if !pool.metadata.add_finalizer(NODE_ALLOCATION_FINALIZER) {
            return Ok(pool);
        }
        debug!(finalizer = NODE_ALLOCATION_FINALIZER, "Adding finalizer");
        Ok(self.client.update(&pool).await?)
    }

    async fn write_status(&self, pool: &NodePool) -> Result<NodePool, ReconcileFailure> {
        self.client.update_status(pool).await.map_err(|e| {
            warn!(error = %e, "Failed to update NodePool status");
            ReconcileFailure::status_write(e)
        })
    }

    async fn admit(&self, mut pool: NodePool) -> ReconcileResult {
        let request = pool.request();
        let now = Utc::now();

        match self.engine.validate_request(&request).await {
            Ok(()) => {
                let (state, _) = next(PoolState::New, PoolEvent::AdmissionPassed);
                apply_state(&mut pool.status.conditions, state, "Handling creation", now);
                pool.status.observed_spec_hash = Some(pool.spec_hash().to_string());
                self.write_status(&pool).await?;
                info!(groups = request.groups.len(), "NodePool admitted");
                Ok(Requeue::short())
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "NodePool admission failed");
                let (state, _) = next(PoolState::New, PoolEvent::AdmissionFailed);
                apply_state(
                    &mut pool.status.conditions,
                    state,
                    &format!("Creation request failed: {e}"),
                    now,
                );
                self.write_status(&pool).await?;
                Ok(Requeue::done())
            }
        }
    }

    async fn enter_updating(&self, mut pool: NodePool) -> Result<NodePool, ReconcileFailure> {
        info!("NodePool spec changed; updating allocation");
        apply_state(
            &mut pool.status.conditions,
            PoolState::Updating,
            "Spec changed",
            Utc::now(),
        );
        pool.status.observed_spec_hash = Some(pool.spec_hash().to_string());
        self.write_status(&pool).await
    }

    async fn recover_drift(&self, request: &PoolRequest) -> Result<(), ReconcileFailure> {
        let drift = self.engine.recover_drift(request).await?;
        if !drift.is_clean() {
            info!(
                recreated = drift.recreated.len(),
                removed = drift.removed.len(),
                "Repaired node drift"
            );
        }
        Ok(())
    }

    async fn repair(&self, pool: &NodePool) -> ReconcileResult {
        self.recover_drift(&pool.request()).await?;
        Ok(Requeue::done())
    }

    async fn progress(&self, mut pool: NodePool, state: PoolState) -> ReconcileResult {
        let request = pool.request();
        self.recover_drift(&request).await?;

        if state == PoolState::Updating {
            if let Some(node) = self.engine.trim_excess(&request).await? {
                debug!(node = %node, "Trim step done");
                return Ok(Requeue::short());
            }
        }

        let step = self.engine.ensure_capacity(&request).await?;
        if let Some(assigned) = &step.assigned {
            debug!(node = %assigned.node, converged = step.status.is_converged(), "Allocation step done");
        }

        if !self.engine.is_fully_satisfied(&request).await? {
            return Ok(Requeue::short());
        }

        let (state, _) = next(state, PoolEvent::AllocationCompleted);
        let nodes = self.engine.allocated_nodes(&request).await?;
        apply_state(&mut pool.status.conditions, state, "Provisioned", Utc::now());
        pool.status.properties.node_names = nodes;
        pool.status.observed_spec_hash = Some(pool.spec_hash().to_string());
        self.write_status(&pool).await?;

        info!(
            nodes = pool.status.properties.node_names.len(),
            "NodePool provisioned"
        );
        Ok(Requeue::done())
    }

    async fn release(&self, mut pool: NodePool) -> ReconcileResult {
        let released = self.engine.release(&pool.spec.cloud_id).await?;

        if pool.metadata.remove_finalizer(NODE_ALLOCATION_FINALIZER) {
            self.client.update(&pool).await?;
        }
        info!(nodes = released, "NodePool released");
        Ok(Requeue::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationStore, HardwareCatalog, HardwareProfile};
    use crate::provisioner::NodeProvisioner;
    use crate::resources::{NodeGroup, NodePoolSpec, ObjectMeta};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    async fn reconciler(nodes: &[&str]) -> (Arc<MemoryStore>, Client, NodePoolReconciler) {
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
        let engine = AllocationEngine::new(store, NodeProvisioner::new(client.clone(), "hwmgr"));
        (memory, client.clone(), NodePoolReconciler::new(client, engine))
    }

    fn pool(size: u32) -> NodePool {
        NodePool::new(
            ObjectMeta::new("hwmgr", "p1"),
            NodePoolSpec {
                cloud_id: "p1".parse().unwrap(),
                node_group: vec![NodeGroup::new(
                    "g1".parse().unwrap(),
                    "edge-profile".parse().unwrap(),
                    size,
                )],
            },
        )
    }

    fn key() -> ObjectKey {
        ObjectKey::new("hwmgr", "p1")
    }

    #[tokio::test]
    async fn test_missing_pool_is_done() {
        let (_, _, reconciler) = reconciler(&["n1"]).await;
        assert!(reconciler.reconcile(&key()).await.unwrap().is_done());
    }

    #[tokio::test]
    async fn test_admission_adds_finalizer_and_hash() {
        let (_, client, reconciler) = reconciler(&["n1"]).await;
        client.create(&pool(1)).await.unwrap();

        let requeue = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(requeue, Requeue::short());

        let stored: NodePool = client.get(&key()).await.unwrap();
        assert!(stored.metadata.has_finalizer(NODE_ALLOCATION_FINALIZER));
        assert_eq!(
            PoolState::from_conditions(&stored.status.conditions),
            PoolState::Provisioning
        );
        assert_eq!(
            stored.status.observed_spec_hash.as_deref(),
            Some(stored.spec_hash().as_str())
        );
    }

    #[tokio::test]
    async fn test_transient_admission_error_is_surfaced() {
        let (_, client, reconciler) = reconciler(&["n1"]).await;
        client.create(&pool(1)).await.unwrap();
        client
            .delete::<crate::resources::InventoryRecord>(&ObjectKey::new("hwmgr", "nodelist"))
            .await
            .unwrap();

        let failure = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(failure.source.is_transient());

        let stored: NodePool = client.get(&key()).await.unwrap();
        assert_eq!(PoolState::from_conditions(&stored.status.conditions), PoolState::New);
    }

    #[tokio::test]
    async fn test_status_write_failure_requeues_medium() {
        let (memory, client, reconciler) = reconciler(&["n1"]).await;
        let created = client.create(&pool(1)).await.unwrap();
        let mut with_finalizer = created.clone();
        with_finalizer.metadata.add_finalizer(NODE_ALLOCATION_FINALIZER);
        client.update(&with_finalizer).await.unwrap();

        memory.inject_conflicts("NodePool", 100);
        let failure = reconciler.reconcile(&key()).await.unwrap_err();
        assert_eq!(failure.requeue, Requeue::medium());
        assert!(matches!(failure.source, HwMgrError::StoreUnavailable(_)));
    }
}
