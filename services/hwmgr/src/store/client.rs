//! Typed access to the object store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hwmgr_reconcile::{retry_on_conflict, RetryPolicy};
use serde_json::Value;
use tracing::debug;

use super::{ObjectStore, RawObject, StoreError, StoreResult};
use crate::resources::{ObjectKey, Owner, Resource};

/// How [`Client::create_or_update`] treats an object that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `AlreadyExists`.
    Create,
    /// Replace the stored object.
    Update,
    /// Merge the object into the stored one (JSON merge patch).
    Patch,
}

/// Typed client over an [`ObjectStore`].
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl Client {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn get<R: Resource>(&self, key: &ObjectKey) -> StoreResult<R> {
        self.store.get(R::KIND, key).await?.into_resource()
    }

    /// Like [`Client::get`], with absence as `None`.
    pub async fn get_opt<R: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<R>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<R: Resource>(&self, namespace: &str) -> StoreResult<Vec<R>> {
        self.store
            .list(R::KIND, namespace)
            .await?
            .into_iter()
            .map(RawObject::into_resource)
            .collect()
    }

    pub async fn create<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        self.store
            .create(RawObject::from_resource(obj)?)
            .await?
            .into_resource()
    }

    /// Replaces the stored object. Fails with a conflict on a stale version.
    pub async fn update<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        self.store
            .update(RawObject::from_resource(obj)?)
            .await?
            .into_resource()
    }

    /// Creates `obj`, or writes it over an existing object according to `mode`.
    ///
    /// When `owner` is given and shares the object's namespace, it is recorded
    /// as the controlling owner reference.
    pub async fn create_or_update<R: Resource>(
        &self,
        obj: &R,
        owner: Option<&Owner>,
        mode: WriteMode,
    ) -> StoreResult<R> {
        let mut obj = obj.clone();
        if let Some(owner) = owner {
            obj.metadata_mut().set_controller_reference(owner);
        }

        let Some(existing) = self.get_opt::<R>(&obj.key()).await? else {
            debug!(kind = R::KIND, key = %obj.key(), "Creating object");
            return self.create(&obj).await;
        };

        match mode {
            WriteMode::Create => Err(StoreError::AlreadyExists {
                kind: R::KIND.to_string(),
                key: obj.key(),
            }),
            WriteMode::Update => {
                obj.metadata_mut().resource_version = existing.metadata().resource_version;
                debug!(kind = R::KIND, key = %obj.key(), "Updating object");
                self.update(&obj).await
            }
            WriteMode::Patch => {
                let mut merged = RawObject::from_resource(&existing)?;
                let patch = RawObject::from_resource(&obj)?;
                let mut body = Value::Object(std::mem::take(&mut merged.body));
                merge_patch(&mut body, &Value::Object(patch.body));
                if let Value::Object(map) = body {
                    merged.body = map;
                }
                if let Some(owner) = owner {
                    merged.metadata.set_controller_reference(owner);
                }
                debug!(kind = R::KIND, key = %obj.key(), "Patching object");
                self.store.update(merged).await?.into_resource()
            }
        }
    }

    /// Writes only the status of `obj`, retrying on conflict.
    ///
    /// The first attempt uses `obj` as given; later attempts re-read the
    /// object and carry `obj`'s status onto it.
    pub async fn update_status<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        let desired = RawObject::from_resource(obj)?;
        let first = AtomicBool::new(true);

        let written = retry_on_conflict(self.retry, StoreError::is_conflict, || {
            let (desired, first) = (&desired, &first);
            async move {
                let candidate = if first.swap(false, Ordering::Relaxed) {
                    desired.clone()
                } else {
                    let mut fresh = self.store.get(&desired.kind, &desired.key()).await?;
                    fresh.set_status(desired.status().cloned());
                    fresh
                };
                self.store.update_status(candidate).await
            }
        })
        .await
        .map_err(|e| StoreError::from_retry(format!("{} {}", R::KIND, desired.key()), e))?;

        written.into_resource()
    }

    /// Deletes the object. Returns false if it did not exist.
    pub async fn delete<R: Resource>(&self, key: &ObjectKey) -> StoreResult<bool> {
        match self.store.delete(R::KIND, key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Applies a JSON merge patch to `target`: objects merge recursively, `null`
/// removes a field, anything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
