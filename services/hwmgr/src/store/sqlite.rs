//! SQLite-backed object store.
//!
//! Each object is one row holding its JSON document. Every write runs in an
//! immediate transaction so the version check and the write are atomic with
//! respect to other processes sharing the file (the service and `hwctl`).

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use super::semantics::{self, WriteEffect};
use super::{ObjectStore, RawObject, StoreError, StoreResult};
use crate::resources::ObjectKey;

/// Durable store over a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                resource_version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, namespace, name)
            );

            CREATE INDEX IF NOT EXISTS idx_objects_kind_namespace
                ON objects(kind, namespace);
            "#,
        )?;
        debug!("Object store schema initialized");
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Runs a write decision inside an immediate transaction.
    async fn write<F>(&self, kind: String, key: ObjectKey, decide: F) -> StoreResult<Option<RawObject>>
    where
        F: FnOnce(Option<&RawObject>) -> StoreResult<WriteEffect> + Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = load(&tx, &kind, &key)?;
            let written = match decide(current.as_ref())? {
                WriteEffect::Put(object) => {
                    put(&tx, &object)?;
                    Some(object)
                }
                WriteEffect::Remove(object) => {
                    tx.execute(
                        "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                        params![kind, key.namespace, key.name],
                    )?;
                    Some(object)
                }
                WriteEffect::Unchanged => current,
            };
            tx.commit()?;
            Ok(written)
        })
        .await
    }
}

fn load(tx: &Transaction<'_>, kind: &str, key: &ObjectKey) -> StoreResult<Option<RawObject>> {
    let body: Option<String> = tx
        .query_row(
            "SELECT body FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![kind, key.namespace, key.name],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
        .transpose()
}

fn put(tx: &Transaction<'_>, object: &RawObject) -> StoreResult<()> {
    let body = serde_json::to_string(object)?;
    tx.execute(
        r#"
        INSERT INTO objects (kind, namespace, name, resource_version, body, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(kind, namespace, name) DO UPDATE SET
            resource_version = excluded.resource_version,
            body = excluded.body,
            updated_at = excluded.updated_at
        "#,
        params![
            object.kind,
            object.metadata.namespace,
            object.metadata.name,
            object.metadata.resource_version as i64,
            body,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn not_found(kind: String, key: ObjectKey) -> StoreError {
    StoreError::NotFound { kind, key }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<RawObject> {
        let (kind, key) = (kind.to_string(), key.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let found = load(&tx, &kind, &key)?;
            found.ok_or_else(|| not_found(kind, key))
        })
        .await
    }

    async fn list(&self, kind: &str, namespace: &str) -> StoreResult<Vec<RawObject>> {
        let (kind, namespace) = (kind.to_string(), namespace.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM objects WHERE kind = ?1 AND namespace = ?2 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![kind, namespace], |row| row.get::<_, String>(0))?;

            let mut objects = Vec::new();
            for row in rows {
                objects.push(serde_json::from_str(&row?)?);
            }
            Ok(objects)
        })
        .await
    }

    async fn create(&self, object: RawObject) -> StoreResult<RawObject> {
        let (kind, key) = (object.kind.clone(), object.key());
        let written = self
            .write(kind.clone(), key.clone(), move |current| {
                semantics::create(current, object, Utc::now()).map(WriteEffect::Put)
            })
            .await?;
        written.ok_or_else(|| not_found(kind, key))
    }

    async fn update(&self, object: RawObject) -> StoreResult<RawObject> {
        let (kind, key) = (object.kind.clone(), object.key());
        let written = self
            .write(kind.clone(), key.clone(), move |current| {
                semantics::update(current, object)
            })
            .await?;
        written.ok_or_else(|| not_found(kind, key))
    }

    async fn update_status(&self, object: RawObject) -> StoreResult<RawObject> {
        let (kind, key) = (object.kind.clone(), object.key());
        let written = self
            .write(kind.clone(), key.clone(), move |current| {
                semantics::update_status(current, object)
            })
            .await?;
        written.ok_or_else(|| not_found(kind, key))
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        let (kind, key) = (kind.to_string(), key.clone());
        self.write(kind.clone(), key.clone(), move |current| {
            semantics::delete(current, &kind, &key, Utc::now())
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{InventoryRecord, Resource};

    fn record() -> RawObject {
        let mut record = InventoryRecord::new("hwmgr");
        record
            .data
            .insert("hwprofiles".to_string(), "profiles: []\n".to_string());
        RawObject::from_resource(&record).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create(record()).await.unwrap();
        let fetched = store
            .get(InventoryRecord::KIND, &created.key())
            .await
            .unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create(record()).await.unwrap();

        let first = store.update(created.clone()).await.unwrap();
        assert_eq!(first.metadata.resource_version, 2);

        let err = store.update(created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(record()).await.unwrap();
        let err = store.create(record()).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store.create(record()).await.unwrap();
        store
            .delete(InventoryRecord::KIND, &created.key())
            .await
            .unwrap();
        assert!(store
            .list(InventoryRecord::KIND, "hwmgr")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let created = {
            let store = SqliteStore::open(&path).unwrap();
            store.create(record()).await.unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        let fetched = store
            .get(InventoryRecord::KIND, &created.key())
            .await
            .unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
        assert_eq!(fetched.body, created.body);
    }
}
