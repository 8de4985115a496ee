//! In-memory object store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::semantics::{self, WriteEffect};
use super::{ObjectStore, RawObject, StoreError, StoreResult};
use crate::resources::ObjectKey;

type Objects = BTreeMap<(String, ObjectKey), RawObject>;

#[derive(Debug, Default)]
struct Faults {
    /// Pending forced conflicts per kind, consumed by updates.
    conflicts: HashMap<String, u32>,
    offline: bool,
}

/// Process-local store.
///
/// Supports fault injection: forced update conflicts per kind, and an offline
/// switch that fails every call with [`StoreError::Unavailable`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<Objects>,
    faults: Mutex<Faults>,
    writes: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` updates of `kind` fail with a conflict.
    pub fn inject_conflicts(&self, kind: &str, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.conflicts.insert(kind.to_string(), count);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.offline = offline;
        }
    }

    /// Number of successful writes of `kind` so far.
    pub fn write_count(&self, kind: &str) -> u64 {
        self.writes
            .lock()
            .map(|w| w.get(kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn objects(&self) -> StoreResult<MutexGuard<'_, Objects>> {
        self.check_online()?;
        self.objects
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn check_online(&self) -> StoreResult<()> {
        let faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if faults.offline {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn forced_conflict(&self, object: &RawObject) -> StoreResult<()> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if let Some(remaining) = faults.conflicts.get_mut(&object.kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Conflict {
                    kind: object.kind.clone(),
                    key: object.key(),
                    expected: object.metadata.resource_version,
                    actual: object.metadata.resource_version + 1,
                });
            }
        }
        Ok(())
    }

    fn record_write(&self, kind: &str) {
        if let Ok(mut writes) = self.writes.lock() {
            *writes.entry(kind.to_string()).or_default() += 1;
        }
    }

    fn apply(&self, objects: &mut Objects, effect: WriteEffect) -> Option<RawObject> {
        match effect {
            WriteEffect::Put(object) => {
                self.record_write(&object.kind);
                objects.insert((object.kind.clone(), object.key()), object.clone());
                Some(object)
            }
            WriteEffect::Remove(object) => {
                self.record_write(&object.kind);
                objects.remove(&(object.kind.clone(), object.key()));
                Some(object)
            }
            WriteEffect::Unchanged => None,
        }
    }

    fn write(
        &self,
        object: RawObject,
        decide: fn(Option<&RawObject>, RawObject) -> StoreResult<WriteEffect>,
    ) -> StoreResult<RawObject> {
        self.forced_conflict(&object)?;
        let mut objects = self.objects()?;
        let slot = (object.kind.clone(), object.key());
        let effect = decide(objects.get(&slot), object)?;
        match self.apply(&mut objects, effect) {
            Some(written) => Ok(written),
            None => objects.get(&slot).cloned().ok_or_else(|| StoreError::NotFound {
                kind: slot.0.clone(),
                key: slot.1.clone(),
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<RawObject> {
        let objects = self.objects()?;
        objects
            .get(&(kind.to_string(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })
    }

    async fn list(&self, kind: &str, namespace: &str) -> StoreResult<Vec<RawObject>> {
        let objects = self.objects()?;
        Ok(objects
            .iter()
            .filter(|((k, key), _)| k == kind && key.namespace == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, object: RawObject) -> StoreResult<RawObject> {
        let mut objects = self.objects()?;
        let slot = (object.kind.clone(), object.key());
        let created = semantics::create(objects.get(&slot), object, Utc::now())?;
        self.record_write(&created.kind);
        objects.insert(slot, created.clone());
        Ok(created)
    }

    async fn update(&self, object: RawObject) -> StoreResult<RawObject> {
        self.write(object, semantics::update)
    }

    async fn update_status(&self, object: RawObject) -> StoreResult<RawObject> {
        self.write(object, semantics::update_status)
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        let mut objects = self.objects()?;
        let slot = (kind.to_string(), key.clone());
        let effect = semantics::delete(objects.get(&slot), kind, key, Utc::now())?;
        self.apply(&mut objects, effect);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{InventoryRecord, Resource};

    fn record() -> RawObject {
        RawObject::from_resource(&InventoryRecord::new("hwmgr")).unwrap()
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let store = MemoryStore::new();
        let created = store.create(record()).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);

        let fetched = store.get("ConfigMap", &created.key()).await.unwrap();
        assert_eq!(fetched, created);

        assert_eq!(store.list("ConfigMap", "hwmgr").await.unwrap().len(), 1);
        assert!(store.list("ConfigMap", "other").await.unwrap().is_empty());
        assert!(store.list("Node", "hwmgr").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = MemoryStore::new();
        let created = store.create(record()).await.unwrap();
        store.inject_conflicts(InventoryRecord::KIND, 1);

        let err = store.update(created.clone()).await.unwrap_err();
        assert!(err.is_conflict());

        let updated = store.update(created).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);
        assert_eq!(store.write_count(InventoryRecord::KIND), 2);
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store
            .get("ConfigMap", &ObjectKey::new("hwmgr", "nodelist"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_offline(false);
        let err = store
            .get("ConfigMap", &ObjectKey::new("hwmgr", "nodelist"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .delete("Node", &ObjectKey::new("hwmgr", "n1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
