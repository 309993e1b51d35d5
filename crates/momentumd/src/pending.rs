//! FIFO of tasks waiting for a sync-mode slot.

use momentum_core::{Task, TaskId};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct PendingQueue {
    order: VecDeque<Task>,
    members: HashSet<TaskId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` unless it is already queued.
    pub fn push(&mut self, task: Task) -> bool {
        if !self.members.insert(task.id.clone()) {
            return false;
        }
        self.order.push_back(task);
        true
    }

    pub fn pop_front(&mut self) -> Option<Task> {
        let task = self.order.pop_front()?;
        self.members.remove(&task.id);
        Some(task)
    }

    pub fn remove(&mut self, task_id: &TaskId) -> Option<Task> {
        if !self.members.remove(task_id) {
            return None;
        }
        let index = self.order.iter().position(|task| &task.id == task_id)?;
        self.order.remove(index)
    }

    /// Empty the queue, oldest first.
    pub fn drain_all(&mut self) -> Vec<Task> {
        self.members.clear();
        self.order.drain(..).collect()
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.members.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.order.iter().map(|task| task.id.clone()).collect()
    }
}
