//! Object metadata shared by every stored resource.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Namespaced key of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from a dependent object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

/// An owner together with the namespace it lives in.
///
/// Owner references are only recorded when owner and dependent share a
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub namespace: String,
    pub reference: OwnerReference,
}

/// Standard object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    /// Assigned by the store on creation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Bumped by the store on every write; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,

    /// Bumped by the store whenever `spec` changes.
    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set by the store when deletion is requested while finalizers remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Returns true once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds a finalizer; returns true if it was not already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes a finalizer; returns true if it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    /// Records `owner` as the controlling owner of this object.
    ///
    /// Cross-namespace owners are not recorded; returns whether the reference
    /// was set.
    pub fn set_controller_reference(&mut self, owner: &Owner) -> bool {
        if owner.namespace != self.namespace {
            return false;
        }

        self.owner_references
            .retain(|r| !(r.controller || r.uid == owner.reference.uid));
        self.owner_references.push(OwnerReference {
            controller: true,
            ..owner.reference.clone()
        });
        true
    }
}

/// A typed object that can be kept in the object store.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name used as the store's type discriminator.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    /// This object as an owner of dependents.
    fn as_owner(&self) -> Owner {
        let meta = self.metadata();
        Owner {
            namespace: meta.namespace.clone(),
            reference: OwnerReference {
                kind: Self::KIND.to_string(),
                name: meta.name.clone(),
                uid: meta.uid.clone(),
                controller: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(namespace: &str) -> Owner {
        Owner {
            namespace: namespace.to_string(),
            reference: OwnerReference {
                kind: "NodePool".to_string(),
                name: "p1".to_string(),
                uid: "uid-1".to_string(),
                controller: true,
            },
        }
    }

    #[test]
    fn test_finalizers() {
        let mut meta = ObjectMeta::new("hwmgr", "p1");
        assert!(meta.add_finalizer("a"));
        assert!(!meta.add_finalizer("a"));
        assert!(meta.has_finalizer("a"));
        assert!(meta.remove_finalizer("a"));
        assert!(!meta.remove_finalizer("a"));
    }

    #[test]
    fn test_controller_reference_same_namespace_only() {
        let mut meta = ObjectMeta::new("hwmgr", "n1");
        assert!(!meta.set_controller_reference(&owner("other")));
        assert!(meta.owner_references.is_empty());

        assert!(meta.set_controller_reference(&owner("hwmgr")));
        assert!(meta.set_controller_reference(&owner("hwmgr")));
        assert_eq!(meta.owner_references.len(), 1);
        assert_eq!(meta.owner_references[0].uid, "uid-1");
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("hwmgr", "nodelist").to_string(), "hwmgr/nodelist");
    }
}
