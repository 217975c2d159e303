//! Stable exit codes for engine CLI commands.

use crate::core::state::WorkflowState;

/// Command succeeded, or the inspected run completed.
pub const OK: i32 = 0;
/// Invalid input, configuration, unknown run, or any other failure.
pub const INVALID: i32 = 1;
/// The run ended in the `error` state.
pub const RUN_ERROR: i32 = 2;
/// The run ended in the `timedOut` state.
pub const TIMED_OUT: i32 = 3;
/// The run is still `pending` or `running`.
pub const IN_PROGRESS: i32 = 4;

/// Exit code reporting a run's derived state.
pub fn for_state(state: WorkflowState) -> i32 {
    match state {
        WorkflowState::Completed => OK,
        WorkflowState::Error => RUN_ERROR,
        WorkflowState::TimedOut => TIMED_OUT,
        WorkflowState::Pending | WorkflowState::Running => IN_PROGRESS,
    }
}
