//! Free-node resolution.

use std::collections::HashSet;

use hwmgr_id::{NodeName, ProfileName};

use super::record::{AllocationRecord, HardwareCatalog};

/// Nodes declared under `profile` that no pool has been assigned, in declared
/// order. Unknown profiles yield nothing; duplicate declarations yield once.
pub fn free_nodes(
    catalog: &HardwareCatalog,
    record: &AllocationRecord,
    profile: &ProfileName,
) -> Vec<NodeName> {
    let in_use: HashSet<&NodeName> = record.all_assigned().collect();
    let mut seen = HashSet::new();

    catalog
        .nodes(profile)
        .filter(|node| !in_use.contains(node) && seen.insert(*node))
        .cloned()
        .collect()
}
