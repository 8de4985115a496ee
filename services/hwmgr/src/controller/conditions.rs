//! Status condition helpers.

use chrono::{DateTime, Utc};

use crate::resources::{Condition, ConditionReason, ConditionType};

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status)
}

/// Sets a condition in place, appending it if absent.
///
/// `lastTransitionTime` only moves when the status flips. Returns true if
/// anything changed.
pub fn set_status_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: bool,
    reason: ConditionReason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> bool {
    let message = message.into();

    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) else {
        conditions.push(Condition {
            type_,
            status,
            reason,
            message,
            last_transition_time: now,
        });
        return true;
    };

    let changed = existing.status != status || existing.reason != reason || existing.message != message;
    if existing.status != status {
        existing.last_transition_time = now;
    }
    existing.status = status;
    existing.reason = reason;
    existing.message = message;
    changed
}

/// Sets an existing condition to false; absent conditions stay absent.
pub fn clear_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    reason: ConditionReason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> bool {
    if find_condition(conditions, type_).is_none() {
        return false;
    }
    set_status_condition(conditions, type_, false, reason, message, now)
}
