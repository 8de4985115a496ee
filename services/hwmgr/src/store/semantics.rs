//! Write rules shared by every backend.
//!
//! Backends load the current object, call one of these functions under their
//! own lock or transaction, and apply the returned [`WriteEffect`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{RawObject, StoreError, StoreResult};
use crate::resources::ObjectKey;

/// What a backend must do after a write has been decided.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteEffect {
    /// Store this object (insert or replace).
    Put(RawObject),

    /// Remove the object; carries its final state.
    Remove(RawObject),

    /// Nothing to write.
    Unchanged,
}

/// Prepares a new object for insertion.
pub fn create(current: Option<&RawObject>, mut object: RawObject, now: DateTime<Utc>) -> StoreResult<RawObject> {
    if current.is_some() {
        return Err(StoreError::AlreadyExists {
            kind: object.kind,
            key: object.metadata.key(),
        });
    }

    let meta = &mut object.metadata;
    meta.uid = uuid::Uuid::new_v4().to_string();
    meta.resource_version = 1;
    meta.generation = 1;
    meta.creation_timestamp = Some(now);
    meta.deletion_timestamp = None;
    Ok(object)
}

/// Applies a full update. `status` is carried over from the stored object.
pub fn update(current: Option<&RawObject>, mut object: RawObject) -> StoreResult<WriteEffect> {
    let current = check_version(current, &object)?;

    object.set_status(current.status().cloned());
    let changed = content(&object) != content(current);

    let meta = &mut object.metadata;
    meta.uid = current.metadata.uid.clone();
    meta.creation_timestamp = current.metadata.creation_timestamp;
    meta.deletion_timestamp = current.metadata.deletion_timestamp;
    meta.resource_version = current.metadata.resource_version + 1;
    meta.generation = if changed {
        current.metadata.generation + 1
    } else {
        current.metadata.generation
    };

    Ok(finish(object))
}

/// Applies a status-only update. Everything but `status` is kept as stored.
pub fn update_status(current: Option<&RawObject>, object: RawObject) -> StoreResult<WriteEffect> {
    let current = check_version(current, &object)?;

    let mut next = current.clone();
    next.set_status(object.status().cloned());
    next.metadata.resource_version = current.metadata.resource_version + 1;

    Ok(WriteEffect::Put(next))
}

/// Deletes an object, or stamps `deletionTimestamp` while finalizers remain.
pub fn delete(
    current: Option<&RawObject>,
    kind: &str,
    key: &ObjectKey,
    now: DateTime<Utc>,
) -> StoreResult<WriteEffect> {
    let Some(current) = current else {
        return Err(StoreError::NotFound {
            kind: kind.to_string(),
            key: key.clone(),
        });
    };

    if current.metadata.finalizers.is_empty() {
        return Ok(WriteEffect::Remove(current.clone()));
    }
    if current.metadata.is_deleting() {
        return Ok(WriteEffect::Unchanged);
    }

    let mut next = current.clone();
    next.metadata.deletion_timestamp = Some(now);
    next.metadata.resource_version = current.metadata.resource_version + 1;
    Ok(WriteEffect::Put(next))
}

fn check_version<'a>(current: Option<&'a RawObject>, object: &RawObject) -> StoreResult<&'a RawObject> {
    let Some(current) = current else {
        return Err(StoreError::NotFound {
            kind: object.kind.clone(),
            key: object.metadata.key(),
        });
    };

    if current.metadata.resource_version != object.metadata.resource_version {
        return Err(StoreError::Conflict {
            kind: object.kind.clone(),
            key: object.metadata.key(),
            expected: object.metadata.resource_version,
            actual: current.metadata.resource_version,
        });
    }
    Ok(current)
}

/// The body without `status`: what `generation` tracks.
fn content(object: &RawObject) -> Vec<(&String, &Value)> {
    object.body.iter().filter(|(k, _)| k.as_str() != "status").collect()
}

/// An object marked for deletion goes away once its last finalizer is removed.
fn finish(object: RawObject) -> WriteEffect {
    if object.metadata.is_deleting() && object.metadata.finalizers.is_empty() {
        WriteEffect::Remove(object)
    } else {
        WriteEffect::Put(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ObjectMeta;
    use serde_json::json;

    fn object(name: &str) -> RawObject {
        let mut body = serde_json::Map::new();
        body.insert("spec".to_string(), json!({"size": 1}));
        body.insert("status".to_string(), json!({"conditions": []}));
        RawObject {
            kind: "NodePool".to_string(),
            metadata: ObjectMeta::new("hwmgr", name),
            body,
        }
    }

    fn created(name: &str) -> RawObject {
        create(None, object(name), Utc::now()).unwrap()
    }

    fn put(effect: WriteEffect) -> RawObject {
        match effect {
            WriteEffect::Put(obj) => obj,
            other => panic!("expected Put, got {other:?}"),
        }
    }

    #[test]
    fn test_create_assigns_identity() {
        let obj = created("p1");
        assert!(!obj.metadata.uid.is_empty());
        assert_eq!(obj.metadata.resource_version, 1);
        assert_eq!(obj.metadata.generation, 1);
        assert!(obj.metadata.creation_timestamp.is_some());
    }

    #[test]
    fn test_create_existing_fails() {
        let current = created("p1");
        let err = create(Some(&current), object("p1"), Utc::now()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_update_stale_version_conflicts() {
        let current = created("p1");
        let mut stale = current.clone();
        stale.metadata.resource_version = 0;
        let err = update(Some(&current), stale).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_update_bumps_generation_only_on_spec_change() {
        let current = created("p1");

        let mut same = current.clone();
        same.metadata.finalizers.push("f".to_string());
        let next = put(update(Some(&current), same).unwrap());
        assert_eq!(next.metadata.resource_version, 2);
        assert_eq!(next.metadata.generation, 1);

        let mut edited = next.clone();
        edited.body.insert("spec".to_string(), json!({"size": 2}));
        let next = put(update(Some(&next), edited).unwrap());
        assert_eq!(next.metadata.resource_version, 3);
        assert_eq!(next.metadata.generation, 2);
    }

    #[test]
    fn test_update_preserves_status() {
        let current = created("p1");
        let mut incoming = current.clone();
        incoming.set_status(Some(json!({"conditions": ["bogus"]})));
        let next = put(update(Some(&current), incoming).unwrap());
        assert_eq!(next.status(), current.status());
    }

    #[test]
    fn test_update_status_touches_only_status() {
        let current = created("p1");
        let mut incoming = current.clone();
        incoming.body.insert("spec".to_string(), json!({"size": 9}));
        incoming.set_status(Some(json!({"conditions": ["x"]})));

        let next = put(update_status(Some(&current), incoming).unwrap());
        assert_eq!(next.body["spec"], json!({"size": 1}));
        assert_eq!(next.status(), Some(&json!({"conditions": ["x"]})));
        assert_eq!(next.metadata.generation, 1);
        assert_eq!(next.metadata.resource_version, 2);
    }

    #[test]
    fn test_delete_honors_finalizers() {
        let mut current = created("p1");
        current.metadata.finalizers.push("hwmgr.io/node-allocation".to_string());

        let marked = put(delete(Some(&current), "NodePool", &current.key(), Utc::now()).unwrap());
        assert!(marked.metadata.is_deleting());
        assert_eq!(
            delete(Some(&marked), "NodePool", &marked.key(), Utc::now()).unwrap(),
            WriteEffect::Unchanged
        );

        let mut released = marked.clone();
        released.metadata.finalizers.clear();
        assert!(matches!(
            update(Some(&marked), released).unwrap(),
            WriteEffect::Remove(_)
        ));
    }

    #[test]
    fn test_delete_without_finalizers_removes() {
        let current = created("p1");
        assert!(matches!(
            delete(Some(&current), "NodePool", &current.key(), Utc::now()).unwrap(),
            WriteEffect::Remove(_)
        ));
        assert!(delete(None, "NodePool", &ObjectKey::new("hwmgr", "p1"), Utc::now()).unwrap_err().is_not_found());
    }
}
