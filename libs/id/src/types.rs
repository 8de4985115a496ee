//! Typed name definitions for hardware management resources.
//!
//! Names come from user manifests and the inventory record, so they are kept
//! as written. Only empty, oversized or control-character names are refused.

use crate::{define_name, IdError};

/// Maximum length of any name.
pub const MAX_NAME_LEN: usize = 253;

/// Validate a name against the shared naming rules.
///
/// Names are 1 to 253 characters with no control characters. Case and
/// punctuation are preserved as given.
pub fn validate_name(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let len = s.chars().count();
    if len > MAX_NAME_LEN {
        return Err(IdError::TooLong {
            max: MAX_NAME_LEN,
            actual: len,
        });
    }

    if let Some((position, ch)) = s.chars().enumerate().find(|(_, c)| c.is_control()) {
        return Err(IdError::InvalidCharacter { ch, position });
    }

    Ok(())
}

// =============================================================================
// Pools and Groups
// =============================================================================

define_name!(PoolId, "pool id");
define_name!(GroupName, "node group name");

// =============================================================================
// Hardware Inventory
// =============================================================================

define_name!(ProfileName, "hardware profile name");
define_name!(NodeName, "node name");

// =============================================================================
// Tests
// =============================================================================
