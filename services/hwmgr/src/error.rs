//! Hardware manager errors.

use hwmgr_id::{NodeName, ProfileName};
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the allocation core.
#[derive(Debug, Error)]
pub enum HwMgrError {
    /// A required object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object store failed: I/O, timeout, or conflict retries exhausted.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// A hardware profile has fewer free nodes than a group still needs.
    #[error("insufficient capacity in profile {profile}: needed {needed}, available {available}")]
    InsufficientCapacity {
        profile: ProfileName,
        needed: usize,
        available: usize,
    },

    /// A node resource exists that the allocation did not expect.
    #[error("node {node} conflicts with an existing resource: {detail}")]
    ResourceConflict { node: NodeName, detail: String },

    /// A persisted inventory section could not be parsed.
    #[error("invalid {section} section in inventory record: {source}")]
    InvalidRecord {
        section: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
}

impl HwMgrError {
    /// Returns true if retrying later may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::NotFound(_))
    }

    /// Returns true for an optimistic-concurrency conflict on a store write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StoreUnavailable(e) if e.is_conflict())
    }

    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }
}

impl From<StoreError> for HwMgrError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, key } => Self::NotFound(format!("{kind} {key}")),
            other => Self::StoreUnavailable(other),
        }
    }
}

pub type HwResult<T> = Result<T, HwMgrError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ObjectKey;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let not_found: HwMgrError = StoreError::NotFound {
            kind: "ConfigMap".to_string(),
            key: ObjectKey::new("hwmgr", "nodelist"),
        }
        .into();
        assert!(matches!(not_found, HwMgrError::NotFound(ref s) if s == "ConfigMap hwmgr/nodelist"));

        let offline: HwMgrError = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(offline, HwMgrError::StoreUnavailable(_)));
        assert!(offline.is_transient());
    }

    #[test]
    fn test_capacity_message() {
        let err = HwMgrError::InsufficientCapacity {
            profile: "edge-profile".parse().unwrap(),
            needed: 2,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "insufficient capacity in profile edge-profile: needed 2, available 1"
        );
        assert!(!err.is_transient());
    }
}
