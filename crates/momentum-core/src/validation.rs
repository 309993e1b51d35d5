//! Validation for loaded configuration.

use serde::{Deserialize, Serialize};

use crate::config::MomentumConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for MomentumConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut error = |code: &'static str, message: String| {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code,
                message,
            })
        };

        let base_url = self.board.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            error(
                "board.base_url.scheme",
                format!("board base url '{base_url}' must start with http:// or https://"),
            );
        }

        if self.agent.executable.trim().is_empty() {
            error(
                "agent.executable.empty",
                "agent executable must not be empty".to_string(),
            );
        }
        if self.agent.name.trim().is_empty() {
            error("agent.name.empty", "agent name must not be empty".to_string());
        }

        if self.scheduler.idle_poll_secs == 0 {
            error(
                "scheduler.idle_poll.zero",
                "idle poll interval cannot be 0".to_string(),
            );
        }
        if self.scheduler.error_retry_secs == 0 {
            error(
                "scheduler.error_retry.zero",
                "error retry delay cannot be 0".to_string(),
            );
        }

        let feed = &self.feed;
        if feed.initial_backoff_ms == 0 {
            error(
                "feed.initial_backoff.zero",
                "initial reconnect backoff cannot be 0".to_string(),
            );
        }
        if feed.max_backoff_ms < feed.initial_backoff_ms {
            error(
                "feed.max_backoff.below_initial",
                format!(
                    "max backoff {}ms is below initial backoff {}ms",
                    feed.max_backoff_ms, feed.initial_backoff_ms
                ),
            );
        }
        if feed.polling_interval_ms == 0 {
            error(
                "feed.polling_interval.zero",
                "polling interval cannot be 0".to_string(),
            );
        }
        if feed.queue_capacity == 0 {
            error(
                "feed.queue_capacity.zero",
                "event queue capacity must be greater than zero".to_string(),
            );
        }
        if feed.failures_before_polling == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "feed.failures_before_polling.zero",
                message: "failures_before_polling = 0 disables the live feed entirely".to_string(),
            });
        }

        issues
    }
}
