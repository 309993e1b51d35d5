//! Operator console: line commands and status rendering.

use momentum_core::{ExecutionMode, TaskId};

use crate::running::StopOutcome;
use crate::scheduler::SchedulerHandle;
use crate::status::{StatusEvent, StatusKind};

pub const CONSOLE_HELP: &str = "commands: mode sync|async|toggle, stop <task-id>, status, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    SetMode(ExecutionMode),
    ToggleMode,
    Stop(TaskId),
    Status,
    Quit,
    Help,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub fn parse_command(line: &str) -> Result<OperatorCommand, CommandError> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err(CommandError::Empty);
    };
    let argument = words.next();
    if words.next().is_some() {
        return Err(CommandError::Usage(CONSOLE_HELP));
    }

    match (command.to_lowercase().as_str(), argument) {
        ("mode", Some(arg)) if arg.eq_ignore_ascii_case("toggle") => Ok(OperatorCommand::ToggleMode),
        ("mode", Some(arg)) => arg
            .parse::<ExecutionMode>()
            .map(OperatorCommand::SetMode)
            .map_err(|_| CommandError::Usage("mode sync|async|toggle")),
        ("mode", None) => Err(CommandError::Usage("mode sync|async|toggle")),
        ("stop", Some(task_id)) => Ok(OperatorCommand::Stop(TaskId::new(task_id))),
        ("stop", None) => Err(CommandError::Usage("stop <task-id>")),
        ("status", None) => Ok(OperatorCommand::Status),
        ("quit" | "exit", None) => Ok(OperatorCommand::Quit),
        ("help" | "?", None) => Ok(OperatorCommand::Help),
        (other, _) => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Apply `command` and return the reply for the operator.
pub fn execute(handle: &SchedulerHandle, command: OperatorCommand) -> String {
    match command {
        OperatorCommand::SetMode(mode) => {
            handle.set_mode(mode);
            format!("execution mode -> {mode}")
        }
        OperatorCommand::ToggleMode => {
            handle.toggle_mode();
            format!("execution mode -> {}", handle.mode().toggle())
        }
        OperatorCommand::Stop(task_id) => match handle.request_stop(&task_id) {
            StopOutcome::Requested => format!("stopping {task_id}"),
            StopOutcome::AlreadyRequested => format!("{task_id} is already stopping"),
            StopOutcome::Dequeued => format!("removed {task_id} from the queue"),
            StopOutcome::NotRunning => format!("{task_id} is not running"),
        },
        OperatorCommand::Status => serde_json::to_string_pretty(&handle.snapshot())
            .unwrap_or_else(|err| format!("failed to render status: {err}")),
        OperatorCommand::Quit => {
            handle.shutdown();
            "shutting down".to_string()
        }
        OperatorCommand::Help => CONSOLE_HELP.to_string(),
    }
}

/// One console line per status event.
pub fn render_status(event: &StatusEvent) -> String {
    let at = event.at.format("%H:%M:%S");
    match &event.kind {
        StatusKind::Dispatched {
            task_id,
            title,
            agent,
        } => format!("{at} [{task_id}] started {agent}: {title}"),
        StatusKind::Queued { task_id, position } => {
            format!("{at} [{task_id}] queued at position {position}")
        }
        StatusKind::Output {
            task_id,
            line,
            is_stderr,
        } => {
            let stream = if *is_stderr { "err" } else { "out" };
            format!("{at} [{task_id}] {stream} | {line}")
        }
        StatusKind::Completed {
            task_id,
            exit_code,
            duration_ms,
            stopped_by_operator,
            new_status,
        } => {
            let how = if *stopped_by_operator {
                "stopped".to_string()
            } else {
                format!("exited {exit_code}")
            };
            let status = new_status.map_or_else(String::new, |s| format!(", now {s}"));
            format!("{at} [{task_id}] {how} after {:.1}s{status}", *duration_ms as f64 / 1000.0)
        }
        StatusKind::Failed { task_id, message } => format!("{at} [{task_id}] {message}"),
        StatusKind::Error { message } => format!("{at} error: {message}"),
        StatusKind::ModeChanged { mode } => format!("{at} execution mode: {mode}"),
    }
}
