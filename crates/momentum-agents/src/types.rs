use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AgentError;

/// One line of agent output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub text: String,
    pub is_stderr: bool,
    pub at: DateTime<Utc>,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_stderr: false,
            at: Utc::now(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_stderr: true,
            at: Utc::now(),
        }
    }
}

/// Completion value published once per run.
#[derive(Debug)]
pub struct RunResult {
    /// Process exit code; -1 when the process was killed by a signal or the
    /// wait itself failed.
    pub exit_code: i32,
    pub duration: Duration,
    pub error: Option<AgentError>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}
