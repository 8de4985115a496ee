//! NodePool controller: state machine, reconciler and dispatch worker.

mod conditions;
mod reconciler;
mod state;
mod worker;

pub use conditions::{clear_condition, find_condition, is_condition_true, set_status_condition};
pub use reconciler::{NodePoolReconciler, ReconcileFailure, ReconcileResult};
pub use state::{apply_state, next, Action, PoolEvent, PoolState};
pub use worker::{ControllerWorker, PassStats, WorkerConfig};
