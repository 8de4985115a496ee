//! Pool state machine.
//!
//! The persisted status is an ordered condition list. On load it is reduced to
//! a [`PoolState`]; [`next`] maps a state and an event to the following state
//! and the action the reconciler must take; [`apply_state`] writes a state
//! back into the condition list.

use chrono::{DateTime, Utc};

use super::conditions::{clear_condition, is_condition_true, set_status_condition};
use crate::resources::{Condition, ConditionReason, ConditionType};

/// Lifecycle state of a node pool, derived from its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No conditions yet; the request has not been admitted.
    New,
    /// Admitted; nodes are being allocated.
    Provisioning,
    /// The spec changed after admission; nodes are being added or trimmed.
    Updating,
    /// Every group has its requested size.
    Provisioned,
    /// Admission failed. Terminal until deletion.
    Failed,
    /// Conditions present but none of the above is true.
    Idle,
}

impl PoolState {
    /// Derives the state. Precedence: Failed, Provisioned, Unprovisioned,
    /// Updating.
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        if conditions.is_empty() {
            return Self::New;
        }
        if is_condition_true(conditions, ConditionType::Failed) {
            Self::Failed
        } else if is_condition_true(conditions, ConditionType::Provisioned) {
            Self::Provisioned
        } else if is_condition_true(conditions, ConditionType::Unprovisioned) {
            Self::Provisioning
        } else if is_condition_true(conditions, ConditionType::Updating) {
            Self::Updating
        } else {
            Self::Idle
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Provisioned | Self::Idle)
    }
}

/// Something observed about a pool, or the outcome of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// The pool was delivered with no spec change.
    Observed,
    /// The spec differs from the last observed one.
    SpecChanged,
    DeletionRequested,
    AdmissionPassed,
    AdmissionFailed,
    /// A node was allocated or trimmed but work remains.
    AllocationProgressed,
    AllocationCompleted,
}

/// What the reconciler does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Validate the request against free capacity.
    Admit,
    /// Perform one unit of allocation work.
    Progress,
    /// Release the allocation and drop the finalizer.
    Release,
    /// Re-create or delete Nodes so they match the record.
    Repair,
    None,
}

/// The transition function.
pub fn next(state: PoolState, event: PoolEvent) -> (PoolState, Action) {
    use PoolEvent::*;
    use PoolState::*;

    match (state, event) {
        (_, DeletionRequested) => (state, Action::Release),

        (Failed, _) => (Failed, Action::None),

        (New, Observed | SpecChanged) => (New, Action::Admit),
        (New, AdmissionPassed) => (Provisioning, Action::None),
        (New, AdmissionFailed) => (Failed, Action::None),

        (Provisioned, SpecChanged) => (Updating, Action::Progress),
        (Provisioned, Observed) => (Provisioned, Action::Repair),
        (Provisioned, _) => (Provisioned, Action::None),

        (Provisioning | Updating, SpecChanged) => (Updating, Action::Progress),
        (Provisioning | Updating, Observed) => (state, Action::Progress),
        (Provisioning | Updating, AllocationCompleted) => (Provisioned, Action::None),
        (Provisioning | Updating, AllocationProgressed) => (state, Action::None),

        (state, _) => (state, Action::None),
    }
}

/// Writes `state` into the condition list.
pub fn apply_state(
    conditions: &mut Vec<Condition>,
    state: PoolState,
    message: &str,
    now: DateTime<Utc>,
) {
    use ConditionReason as R;
    use ConditionType as T;

    match state {
        PoolState::Provisioning => {
            set_status_condition(conditions, T::Unprovisioned, true, R::InProgress, message, now);
        }
        PoolState::Failed => {
            set_status_condition(conditions, T::Failed, true, R::Failed, message, now);
        }
        PoolState::Updating => {
            clear_condition(conditions, T::Provisioned, R::SpecChanged, message, now);
            clear_condition(conditions, T::Unprovisioned, R::SpecChanged, message, now);
            set_status_condition(conditions, T::Updating, true, R::InProgress, message, now);
        }
        PoolState::Provisioned => {
            clear_condition(conditions, T::Unprovisioned, R::Completed, message, now);
            clear_condition(conditions, T::Updating, R::Completed, message, now);
            set_status_condition(conditions, T::Provisioned, true, R::Completed, message, now);
        }
        PoolState::New | PoolState::Idle => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn conditions_for(state: PoolState) -> Vec<Condition> {
        let mut conditions = Vec::new();
        apply_state(&mut conditions, state, "", Utc::now());
        conditions
    }

    #[rstest]
    #[case(PoolState::Provisioning)]
    #[case(PoolState::Updating)]
    #[case(PoolState::Provisioned)]
    #[case(PoolState::Failed)]
    fn test_apply_then_derive(#[case] state: PoolState) {
        assert_eq!(PoolState::from_conditions(&conditions_for(state)), state);
    }

    #[test]
    fn test_empty_conditions_are_new() {
        assert_eq!(PoolState::from_conditions(&[]), PoolState::New);
    }

    #[test]
    fn test_failed_takes_precedence() {
        let mut conditions = conditions_for(PoolState::Provisioning);
        apply_state(&mut conditions, PoolState::Failed, "boom", Utc::now());
        assert_eq!(PoolState::from_conditions(&conditions), PoolState::Failed);
    }

    #[test]
    fn test_full_lifecycle_conditions() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        apply_state(&mut conditions, PoolState::Provisioning, "Handling creation", now);
        apply_state(&mut conditions, PoolState::Provisioned, "Provisioned", now);
        assert_eq!(PoolState::from_conditions(&conditions), PoolState::Provisioned);

        apply_state(&mut conditions, PoolState::Updating, "Spec changed", now);
        assert_eq!(PoolState::from_conditions(&conditions), PoolState::Updating);

        apply_state(&mut conditions, PoolState::Provisioned, "Provisioned", now);
        assert_eq!(PoolState::from_conditions(&conditions), PoolState::Provisioned);
        assert_eq!(conditions.len(), 3, "one entry per condition type");
    }

    #[test]
    fn test_idle_when_nothing_true() {
        let now = Utc::now();
        let mut conditions = conditions_for(PoolState::Provisioning);
        clear_condition(
            &mut conditions,
            ConditionType::Unprovisioned,
            ConditionReason::Completed,
            "",
            now,
        );
        assert_eq!(PoolState::from_conditions(&conditions), PoolState::Idle);
    }

    #[rstest]
    #[case(PoolState::New, PoolEvent::Observed, PoolState::New, Action::Admit)]
    #[case(PoolState::New, PoolEvent::AdmissionPassed, PoolState::Provisioning, Action::None)]
    #[case(PoolState::New, PoolEvent::AdmissionFailed, PoolState::Failed, Action::None)]
    #[case(PoolState::Failed, PoolEvent::Observed, PoolState::Failed, Action::None)]
    #[case(PoolState::Failed, PoolEvent::SpecChanged, PoolState::Failed, Action::None)]
    #[case(PoolState::Failed, PoolEvent::DeletionRequested, PoolState::Failed, Action::Release)]
    #[case(PoolState::Provisioned, PoolEvent::Observed, PoolState::Provisioned, Action::Repair)]
    #[case(PoolState::Provisioned, PoolEvent::AllocationCompleted, PoolState::Provisioned, Action::None)]
    #[case(PoolState::Provisioned, PoolEvent::SpecChanged, PoolState::Updating, Action::Progress)]
    #[case(PoolState::Provisioning, PoolEvent::Observed, PoolState::Provisioning, Action::Progress)]
    #[case(PoolState::Provisioning, PoolEvent::SpecChanged, PoolState::Updating, Action::Progress)]
    #[case(PoolState::Provisioning, PoolEvent::AllocationProgressed, PoolState::Provisioning, Action::None)]
    #[case(PoolState::Provisioning, PoolEvent::AllocationCompleted, PoolState::Provisioned, Action::None)]
    #[case(PoolState::Updating, PoolEvent::Observed, PoolState::Updating, Action::Progress)]
    #[case(PoolState::Updating, PoolEvent::AllocationCompleted, PoolState::Provisioned, Action::None)]
    #[case(PoolState::Idle, PoolEvent::Observed, PoolState::Idle, Action::None)]
    #[case(PoolState::Idle, PoolEvent::DeletionRequested, PoolState::Idle, Action::Release)]
    fn test_transitions(
        #[case] from: PoolState,
        #[case] event: PoolEvent,
        #[case] to: PoolState,
        #[case] action: Action,
    ) {
        assert_eq!(next(from, event), (to, action));
    }
}
