//! Versioned object store.
//!
//! Objects are kept untyped (`RawObject`) behind the `ObjectStore` seam and
//! converted to typed resources by [`Client`]. Every write bumps the
//! object's `resourceVersion`; writes carrying a stale version fail with
//! [`StoreError::Conflict`].
//!
//! Backends:
//! - [`MemoryStore`]: process-local, with fault injection for tests
//! - [`SqliteStore`]: durable, used by the service and the CLI
//!
//! [`TimedStore`] wraps any backend and bounds each call with a deadline.

mod client;
mod memory;
mod semantics;
mod sqlite;
mod timed;

pub use client::{Client, WriteMode};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use timed::TimedStore;

use async_trait::async_trait;
use hwmgr_reconcile::{ReconcileError, RetryError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::resources::{ObjectKey, ObjectMeta, Resource};

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    /// Optimistic concurrency conflict.
    #[error("{kind} {key} was modified: expected resourceVersion {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Collapses the outcome of a conflict-retry loop into a store error.
    pub(crate) fn from_retry(resource: String, err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Failed(e) => e,
            RetryError::Exhausted { attempts, .. } => {
                Self::Reconcile(ReconcileError::ConflictRetriesExhausted { resource, attempts })
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An untyped stored object: kind, metadata, and every other top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl RawObject {
    pub fn from_resource<R: Resource>(resource: &R) -> StoreResult<Self> {
        let mut body = match serde_json::to_value(resource)? {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Unavailable(format!(
                    "{} did not serialize to an object: {other}",
                    R::KIND
                )))
            }
        };
        let metadata = match body.remove("metadata") {
            Some(meta) => serde_json::from_value(meta)?,
            None => resource.metadata().clone(),
        };
        Ok(Self {
            kind: R::KIND.to_string(),
            metadata,
            body,
        })
    }

    pub fn into_resource<R: Resource>(self) -> StoreResult<R> {
        let mut map = self.body;
        map.insert("metadata".to_string(), serde_json::to_value(&self.metadata)?);
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn status(&self) -> Option<&Value> {
        self.body.get("status")
    }

    pub fn set_status(&mut self, status: Option<Value>) {
        match status {
            Some(status) => {
                self.body.insert("status".to_string(), status);
            }
            None => {
                self.body.remove("status");
            }
        }
    }
}

/// Storage seam for versioned objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<RawObject>;

    /// Lists objects of `kind` in `namespace`, ordered by name.
    async fn list(&self, kind: &str, namespace: &str) -> StoreResult<Vec<RawObject>>;

    async fn create(&self, object: RawObject) -> StoreResult<RawObject>;

    /// Replaces everything but `status`. Fails on a stale `resourceVersion`.
    async fn update(&self, object: RawObject) -> StoreResult<RawObject>;

    /// Replaces only `status`. Fails on a stale `resourceVersion`.
    async fn update_status(&self, object: RawObject) -> StoreResult<RawObject>;

    /// Deletes the object, or marks it for deletion while finalizers remain.
    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()>;
}
