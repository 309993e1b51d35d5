use momentum_board::{Board, BoardError};
use momentum_core::{LifecycleMode, Task, TaskStatus};

/// How a finished run ended, as far as the board cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionInput {
    pub stopped_by_operator: bool,
    pub exit_code: i32,
    pub lifecycle: LifecycleMode,
}

/// Status to write when a task is dispatched, if any.
pub fn dispatch_status(lifecycle: LifecycleMode) -> Option<TaskStatus> {
    match lifecycle {
        LifecycleMode::Orchestrator => Some(TaskStatus::InProgress),
        LifecycleMode::Agent => None,
    }
}

/// Status to write when a run ends, if any.
///
/// An operator stop always sends the task back to planning. A clean exit
/// marks it done unless the agent owns its own lifecycle. A failed run is
/// left in progress for someone to look at.
pub fn completion_status(input: CompletionInput) -> Option<TaskStatus> {
    if input.stopped_by_operator {
        return Some(TaskStatus::Planning);
    }
    match (input.exit_code, input.lifecycle) {
        (0, LifecycleMode::Orchestrator) => Some(TaskStatus::Done),
        _ => None,
    }
}

/// Write `status` for `task`. Failures are logged and returned, never retried.
pub fn transition(board: &dyn Board, task: &Task, status: TaskStatus) -> Result<Task, BoardError> {
    match board.set_task_status(&task.id, status) {
        Ok(updated) => {
            tracing::info!(task_id = %task.id, "task {} ({}) -> {}", task.id, task.title, status);
            Ok(updated)
        }
        Err(err) => {
            tracing::warn!(
                task_id = %task.id,
                status = %status,
                error = %err,
                "failed to update task status"
            );
            Err(err)
        }
    }
}
