use serde::{Deserialize, Serialize};

use crate::types::{EpicId, ProjectId, TaskId};

/// How selected tasks are dispatched.
///
/// `Async` starts every selected task immediately; `Sync` keeps at most one
/// agent running and queues the rest in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Async,
    Sync,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Async => "async",
            ExecutionMode::Sync => "sync",
        }
    }

    pub fn toggle(self) -> Self {
        match self {
            ExecutionMode::Async => ExecutionMode::Sync,
            ExecutionMode::Sync => ExecutionMode::Async,
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "async" => Ok(ExecutionMode::Async),
            "sync" => Ok(ExecutionMode::Sync),
            other => Err(format!(
                "invalid execution mode '{other}' (use async or sync)"
            )),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who owns board status transitions for a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    /// The supervisor moves tasks to in_progress, done and planning.
    #[default]
    Orchestrator,
    /// The agent moves its own task; the supervisor only applies the
    /// planning reset when an operator stops a run.
    Agent,
}

impl LifecycleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleMode::Orchestrator => "orchestrator",
            LifecycleMode::Agent => "agent",
        }
    }
}

impl std::str::FromStr for LifecycleMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "orchestrator" => Ok(LifecycleMode::Orchestrator),
            "agent" => Ok(LifecycleMode::Agent),
            other => Err(format!(
                "invalid lifecycle mode '{other}' (use orchestrator or agent)"
            )),
        }
    }
}

impl std::fmt::Display for LifecycleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection scope, fixed for the lifetime of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    Task(TaskId),
    Epic(EpicId),
    Project(ProjectId),
    #[default]
    Global,
}

impl Scope {
    /// Build a scope from optional CLI-style filters. At most one may be set.
    pub fn from_filters(
        task_id: Option<String>,
        epic_id: Option<String>,
        project_id: Option<String>,
    ) -> Result<Self, String> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let task_id = non_empty(task_id);
        let epic_id = non_empty(epic_id);
        let project_id = non_empty(project_id);

        let set = [task_id.is_some(), epic_id.is_some(), project_id.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if set > 1 {
            return Err("at most one of task, epic or project may be given".to_string());
        }

        Ok(match (task_id, epic_id, project_id) {
            (Some(id), _, _) => Scope::Task(TaskId::new(id)),
            (_, Some(id), _) => Scope::Epic(EpicId::new(id)),
            (_, _, Some(id)) => Scope::Project(ProjectId::new(id)),
            _ => Scope::Global,
        })
    }

    /// Operator-facing description of what is being watched.
    pub fn describe(&self) -> String {
        match self {
            Scope::Task(id) => format!("Task: {id}"),
            Scope::Epic(id) => format!("Epic: {id}"),
            Scope::Project(id) => format!("Project: {id}"),
            Scope::Global => "All projects".to_string(),
        }
    }
}
