//! A [`Board`] held in memory, for exercising selection and scheduling
//! without a server. Status writes are applied and recorded.

use momentum_core::{Epic, EpicId, Project, ProjectId, Task, TaskFilters, TaskId, TaskStatus};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::board::Board;
use crate::error::BoardError;

#[derive(Default)]
struct BoardState {
    projects: Vec<Project>,
    epics: Vec<Epic>,
    tasks: Vec<Task>,
    failing: bool,
    status_writes: Vec<(TaskId, TaskStatus)>,
}

#[derive(Default)]
pub struct MemoryBoard {
    state: Mutex<BoardState>,
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project `p1` with an auto epic `auto` and a manual epic `manual`.
    pub fn with_epics() -> Arc<Self> {
        let board = Self::new();
        board.add_project("p1");
        board.add_epic("auto", "p1", true);
        board.add_epic("manual", "p1", false);
        Arc::new(board)
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_project(&self, id: &str) {
        self.lock().projects.push(Project {
            id: ProjectId::new(id),
            name: format!("Project {id}"),
            description: String::new(),
        });
    }

    pub fn add_epic(&self, id: &str, project: &str, auto: bool) {
        self.lock().epics.push(Epic {
            id: EpicId::new(id),
            title: format!("Epic {id}"),
            status: "todo".to_string(),
            project_id: ProjectId::new(project),
            auto,
        });
    }

    pub fn add_task(&self, id: &str, project: &str, epic: Option<&str>, status: TaskStatus) {
        let mut task = Task::new(
            TaskId::new(id),
            ProjectId::new(project),
            format!("Task {id}"),
            status,
        );
        task.epic_id = epic.map(EpicId::new);
        self.lock().tasks.push(task);
    }

    pub fn block(&self, id: &str) {
        if let Some(task) = self.lock().tasks.iter_mut().find(|t| t.id.0 == id) {
            task.blocked = true;
        }
    }

    /// Make every call fail with a 503 until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn status_writes(&self) -> Vec<(TaskId, TaskStatus)> {
        self.lock().status_writes.clone()
    }

    pub fn writes_for(&self, id: &str) -> Vec<TaskStatus> {
        self.lock()
            .status_writes
            .iter()
            .filter(|(task_id, _)| task_id.0 == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.lock().tasks.iter().find(|t| t.id.0 == id).map(|t| t.status)
    }

    fn check(&self) -> Result<(), BoardError> {
        if self.lock().failing {
            return Err(BoardError::Api {
                status: 503,
                message: "board unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl Board for MemoryBoard {
    fn list_projects(&self) -> Result<Vec<Project>, BoardError> {
        self.check()?;
        Ok(self.lock().projects.clone())
    }

    fn list_epics(&self, project_id: &ProjectId) -> Result<Vec<Epic>, BoardError> {
        self.check()?;
        Ok(self
            .lock()
            .epics
            .iter()
            .filter(|e| &e.project_id == project_id)
            .cloned()
            .collect())
    }

    fn list_tasks(
        &self,
        project_id: &ProjectId,
        filters: &TaskFilters,
    ) -> Result<Vec<Task>, BoardError> {
        self.check()?;
        Ok(self
            .lock()
            .tasks
            .iter()
            .filter(|t| &t.project_id == project_id)
            .filter(|t| filters.epic_id.is_none() || t.epic_id == filters.epic_id)
            .filter(|t| filters.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> Result<Task, BoardError> {
        self.check()?;
        let mut state = self.lock();
        state.status_writes.push((task_id.clone(), status));
        let task = state
            .tasks
            .iter_mut()
            .find(|t| &t.id == task_id)
            .ok_or_else(|| BoardError::Api {
                status: 404,
                message: format!("task {task_id} not found"),
            })?;
        task.status = status;
        Ok(task.clone())
    }
}
