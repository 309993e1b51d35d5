//! Which tasks currently own an agent, and whether the operator asked them
//! to stop.

use momentum_agents::AgentRunner;
use momentum_core::TaskId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-task execution state as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    Idle,
    Queued,
    Running,
    CancelRequested,
    Completed,
}

impl TaskRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::CancelRequested => "cancel_requested",
            Self::Completed => "completed",
        }
    }

    /// An agent process exists for the task.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::CancelRequested)
    }
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent finished task ids kept for state reporting.
pub const COMPLETED_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Requested,
    AlreadyRequested,
    /// The task was waiting for a sync slot and has been taken off the queue.
    Dequeued,
}

struct RunSlot {
    state: TaskRunState,
    runner: Option<Arc<AgentRunner>>,
}

#[derive(Default)]
struct RunningInner {
    slots: HashMap<TaskId, RunSlot>,
    completed: VecDeque<TaskId>,
}

impl RunningInner {
    fn forget_completed(&mut self, task_id: &TaskId) {
        self.completed.retain(|id| id != task_id);
    }
}

/// Shared map of active tasks. Every check-then-write happens under one lock
/// so a task can never be claimed twice.
#[derive(Clone, Default)]
pub struct RunningSet {
    inner: Arc<Mutex<RunningInner>>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunningInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Mark `task_id` running. Returns false, and changes nothing, if it
    /// already is.
    pub fn try_claim(&self, task_id: &TaskId) -> bool {
        let mut inner = self.lock();
        if inner.slots.contains_key(task_id) {
            return false;
        }
        inner.forget_completed(task_id);
        inner.slots.insert(
            task_id.clone(),
            RunSlot {
                state: TaskRunState::Running,
                runner: None,
            },
        );
        true
    }

    /// Attach the runner driving a claimed task. A stop requested before the
    /// runner existed is applied now.
    pub fn attach(&self, task_id: &TaskId, runner: Arc<AgentRunner>) -> bool {
        let cancel_now = {
            let mut inner = self.lock();
            let Some(slot) = inner.slots.get_mut(task_id) else {
                return false;
            };
            slot.runner = Some(Arc::clone(&runner));
            slot.state == TaskRunState::CancelRequested
        };
        if cancel_now {
            cancel_runner(task_id, &runner);
        }
        true
    }

    /// Drop a claim whose agent never started.
    pub fn release(&self, task_id: &TaskId) {
        self.lock().slots.remove(task_id);
    }

    /// Record an operator stop and cancel the agent if it is attached.
    pub fn request_stop(&self, task_id: &TaskId) -> StopOutcome {
        let runner = {
            let mut inner = self.lock();
            let Some(slot) = inner.slots.get_mut(task_id) else {
                return StopOutcome::NotRunning;
            };
            if slot.state == TaskRunState::CancelRequested {
                return StopOutcome::AlreadyRequested;
            }
            slot.state = TaskRunState::CancelRequested;
            slot.runner.clone()
        };
        if let Some(runner) = runner {
            cancel_runner(task_id, &runner);
        }
        StopOutcome::Requested
    }

    /// Remove a finished task, returning the state it ended in. Only the
    /// last [`COMPLETED_HISTORY`] finished ids still report `Completed`.
    pub fn finish(&self, task_id: &TaskId) -> TaskRunState {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.remove(task_id) else {
            return TaskRunState::Idle;
        };
        inner.forget_completed(task_id);
        inner.completed.push_back(task_id.clone());
        if inner.completed.len() > COMPLETED_HISTORY {
            inner.completed.pop_front();
        }
        slot.state
    }

    /// Current state. Queued tasks are tracked elsewhere and report `Idle`.
    pub fn state(&self, task_id: &TaskId) -> TaskRunState {
        let inner = self.lock();
        if let Some(slot) = inner.slots.get(task_id) {
            return slot.state;
        }
        if inner.completed.contains(task_id) {
            TaskRunState::Completed
        } else {
            TaskRunState::Idle
        }
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.lock().slots.contains_key(task_id)
    }

    pub fn has_running(&self) -> bool {
        !self.lock().slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active task ids, sorted.
    pub fn running_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.lock().slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every attached runner without marking an operator stop.
    pub fn cancel_all(&self) -> usize {
        let runners: Vec<(TaskId, Arc<AgentRunner>)> = self
            .lock()
            .slots
            .iter()
            .filter_map(|(id, slot)| slot.runner.clone().map(|runner| (id.clone(), runner)))
            .collect();
        for (task_id, runner) in &runners {
            cancel_runner(task_id, runner);
        }
        runners.len()
    }
}

fn cancel_runner(task_id: &TaskId, runner: &AgentRunner) {
    if let Err(err) = runner.cancel() {
        tracing::warn!(task_id = %task_id, error = %err, "failed to cancel agent");
    }
}
