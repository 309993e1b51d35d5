//! Task selection policy.
//!
//! Without an explicit task id only unblocked `todo` tasks under auto epics
//! are eligible. Among eligible tasks the lexicographically greatest id wins,
//! on the assumption that newer tasks carry larger ids.

use momentum_board::{Board, BoardError};
use momentum_core::{EpicId, Project, ProjectId, Scope, Task, TaskFilters, TaskId};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no task available matching the selection criteria")]
    NoneAvailable,
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },
    #[error("epic {epic_id} not found")]
    EpicNotFound { epic_id: EpicId },
    #[error("failed to {action}: {source}")]
    Board {
        action: String,
        #[source]
        source: BoardError,
    },
}

impl SelectError {
    /// The steady-state "nothing to do" outcome.
    pub fn is_none_available(&self) -> bool {
        matches!(self, Self::NoneAvailable)
    }

    fn board(action: impl Into<String>, source: BoardError) -> Self {
        Self::Board {
            action: action.into(),
            source,
        }
    }
}

pub struct TaskSelector {
    board: Arc<dyn Board>,
    scope: Scope,
}

impl TaskSelector {
    pub fn new(board: Arc<dyn Board>, scope: Scope) -> Self {
        Self { board, scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn select(&self) -> Result<Task, SelectError> {
        self.select_excluding(&HashSet::new())
    }

    /// Like [`TaskSelector::select`], skipping ids in `excluded`.
    pub fn select_excluding(&self, excluded: &HashSet<TaskId>) -> Result<Task, SelectError> {
        match &self.scope {
            Scope::Task(task_id) => self.find_task(task_id, excluded),
            Scope::Epic(epic_id) => self.select_from_epic(epic_id, excluded),
            Scope::Project(project_id) => {
                let candidates = self.project_candidates(project_id)?;
                pick_newest(candidates, excluded)
            }
            Scope::Global => self.select_global(excluded),
        }
    }

    fn projects(&self) -> Result<Vec<Project>, SelectError> {
        self.board
            .list_projects()
            .map_err(|err| SelectError::board("list projects", err))
    }

    fn find_task(&self, task_id: &TaskId, excluded: &HashSet<TaskId>) -> Result<Task, SelectError> {
        for project in self.projects()? {
            let tasks = match self.board.list_tasks(&project.id, &TaskFilters::default()) {
                Ok(tasks) => tasks,
                Err(err) => {
                    tracing::debug!(project_id = %project.id, error = %err, "skipping project while looking up task");
                    continue;
                }
            };
            if let Some(task) = tasks.into_iter().find(|task| &task.id == task_id) {
                if excluded.contains(&task.id) {
                    return Err(SelectError::NoneAvailable);
                }
                return Ok(task);
            }
        }
        Err(SelectError::TaskNotFound {
            task_id: task_id.clone(),
        })
    }

    fn select_from_epic(
        &self,
        epic_id: &EpicId,
        excluded: &HashSet<TaskId>,
    ) -> Result<Task, SelectError> {
        let mut found = None;
        for project in self.projects()? {
            let epics = match self.board.list_epics(&project.id) {
                Ok(epics) => epics,
                Err(err) => {
                    tracing::debug!(project_id = %project.id, error = %err, "skipping project while looking up epic");
                    continue;
                }
            };
            if let Some(epic) = epics.into_iter().find(|epic| &epic.id == epic_id) {
                found = Some(epic);
                break;
            }
        }

        let epic = found.ok_or_else(|| SelectError::EpicNotFound {
            epic_id: epic_id.clone(),
        })?;
        if !epic.auto {
            return Err(SelectError::NoneAvailable);
        }

        let filters = TaskFilters {
            epic_id: Some(epic.id.clone()),
            status: None,
        };
        let tasks = self
            .board
            .list_tasks(&epic.project_id, &filters)
            .map_err(|err| SelectError::board(format!("list tasks for epic {epic_id}"), err))?;
        let candidates = tasks
            .into_iter()
            .filter(|task| task.epic_id.as_ref() == Some(&epic.id) && task.is_actionable());
        pick_newest(candidates, excluded)
    }

    /// Actionable tasks of one project that sit under an auto epic.
    fn project_candidates(&self, project_id: &ProjectId) -> Result<Vec<Task>, SelectError> {
        let auto_epics: HashSet<EpicId> = self
            .board
            .list_epics(project_id)
            .map_err(|err| SelectError::board(format!("list epics for project {project_id}"), err))?
            .into_iter()
            .filter(|epic| epic.auto)
            .map(|epic| epic.id)
            .collect();
        if auto_epics.is_empty() {
            return Ok(Vec::new());
        }

        let tasks = self
            .board
            .list_tasks(project_id, &TaskFilters::default())
            .map_err(|err| SelectError::board(format!("list tasks for project {project_id}"), err))?;
        Ok(tasks
            .into_iter()
            .filter(|task| task.is_actionable())
            .filter(|task| {
                task.epic_id
                    .as_ref()
                    .is_some_and(|epic_id| auto_epics.contains(epic_id))
            })
            .collect())
    }

    fn select_global(&self, excluded: &HashSet<TaskId>) -> Result<Task, SelectError> {
        let projects = self.projects()?;
        let mut candidates = Vec::new();
        for project in &projects {
            match self.project_candidates(&project.id) {
                Ok(tasks) => candidates.extend(tasks),
                Err(err) => {
                    tracing::warn!(project_id = %project.id, error = %err, "skipping project during selection");
                }
            }
        }
        pick_newest(candidates, excluded)
    }
}

fn pick_newest(
    candidates: impl IntoIterator<Item = Task>,
    excluded: &HashSet<TaskId>,
) -> Result<Task, SelectError> {
    candidates
        .into_iter()
        .filter(|task| !excluded.contains(&task.id))
        .max_by(|a, b| a.id.cmp(&b.id))
        .ok_or(SelectError::NoneAvailable)
}
