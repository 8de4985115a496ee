//! The inventory record: hardware catalog and allocations in one object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::meta::{ObjectMeta, Resource};

/// Name of the inventory record in the controller namespace.
pub const INVENTORY_RECORD_NAME: &str = "nodelist";

/// Data key holding the YAML hardware catalog.
pub const HWPROFILES_KEY: &str = "hwprofiles";

/// Data key holding the YAML allocation record.
pub const ALLOCATED_KEY: &str = "allocated";

/// Textual key/value record, versioned as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl InventoryRecord {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, INVENTORY_RECORD_NAME),
            data: BTreeMap::new(),
        }
    }
}

impl Resource for InventoryRecord {
    const KIND: &'static str = "ConfigMap";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
