//! Operator-facing status stream.

use chrono::{DateTime, Utc};
use momentum_core::{ExecutionMode, TaskId, TaskStatus};
use serde::Serialize;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};

pub const STATUS_CHANNEL_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusKind {
    Dispatched {
        task_id: TaskId,
        title: String,
        agent: String,
    },
    Queued {
        task_id: TaskId,
        position: usize,
    },
    Output {
        task_id: TaskId,
        line: String,
        is_stderr: bool,
    },
    Completed {
        task_id: TaskId,
        exit_code: i32,
        duration_ms: u64,
        stopped_by_operator: bool,
        new_status: Option<TaskStatus>,
    },
    Failed {
        task_id: TaskId,
        message: String,
    },
    Error {
        message: String,
    },
    ModeChanged {
        mode: ExecutionMode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StatusKind,
}

/// Non-blocking publisher; a slow or absent reader loses events rather than
/// stalling the scheduler.
#[derive(Clone)]
pub struct StatusSink {
    tx: Option<SyncSender<StatusEvent>>,
}

impl StatusSink {
    pub fn channel(capacity: usize) -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: StatusKind) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let event = StatusEvent {
            at: Utc::now(),
            kind,
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("status channel full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
