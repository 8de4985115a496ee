//! Deadline decorator for object stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hwmgr_reconcile::with_deadline;

use super::{ObjectStore, RawObject, StoreResult};
use crate::resources::ObjectKey;

/// Bounds every call of the wrapped store with a deadline.
///
/// A call that does not finish in time fails with
/// [`ReconcileError::Timeout`](hwmgr_reconcile::ReconcileError::Timeout).
pub struct TimedStore {
    inner: Arc<dyn ObjectStore>,
    deadline: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn ObjectStore>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }
}

#[async_trait]
impl ObjectStore for TimedStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<RawObject> {
        with_deadline(kind, self.deadline, self.inner.get(kind, key)).await?
    }

    async fn list(&self, kind: &str, namespace: &str) -> StoreResult<Vec<RawObject>> {
        with_deadline(kind, self.deadline, self.inner.list(kind, namespace)).await?
    }

    async fn create(&self, object: RawObject) -> StoreResult<RawObject> {
        let resource = object.kind.clone();
        with_deadline(&resource, self.deadline, self.inner.create(object)).await?
    }

    async fn update(&self, object: RawObject) -> StoreResult<RawObject> {
        let resource = object.kind.clone();
        with_deadline(&resource, self.deadline, self.inner.update(object)).await?
    }

    async fn update_status(&self, object: RawObject) -> StoreResult<RawObject> {
        let resource = object.kind.clone();
        with_deadline(&resource, self.deadline, self.inner.update_status(object)).await?
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        with_deadline(kind, self.deadline, self.inner.delete(kind, key)).await?
    }
}
