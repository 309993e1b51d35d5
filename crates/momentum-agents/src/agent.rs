//! External coding-agent subprocesses.

use momentum_core::{AgentConfig, CancelToken};
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::AgentError;
use crate::process_tree::{default_process_tree, ProcessTree};

/// Time between the graceful interrupt and the forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

pub type AgentStream = Box<dyn Read + Send>;

/// One external agent process.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    /// Launch the process. Fails with [`AgentError::AlreadyRunning`] while a
    /// previous launch is still alive. Cancelling `cancel` later stops the
    /// process the same way [`Agent::cancel`] does.
    fn start(&self, cancel: &CancelToken, prompt: &str) -> Result<(), AgentError>;
    /// Stdout of the current process. Can be taken once per start.
    fn take_stdout(&self) -> Option<AgentStream>;
    /// Stderr of the current process. Can be taken once per start.
    fn take_stderr(&self) -> Option<AgentStream>;
    /// Block until the process exits and return its exit code.
    fn wait(&self) -> Result<i32, AgentError>;
    /// Interrupt the process tree and escalate to a forced kill after the
    /// grace period. Never blocks on the process.
    fn cancel(&self) -> Result<(), AgentError>;
    fn is_running(&self) -> bool;
    fn pid(&self) -> Option<u32>;
}

/// Set once the process has been reaped.
#[derive(Debug, Default)]
struct ExitLatch {
    exited: Mutex<bool>,
    cond: Condvar,
}

impl ExitLatch {
    fn set(&self) {
        let mut exited = self.exited.lock().unwrap_or_else(|p| p.into_inner());
        *exited = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.exited.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns true if the process exited within `timeout`.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.exited.lock().unwrap_or_else(|p| p.into_inner());
        while !*exited {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(exited, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            exited = guard;
        }
        true
    }
}

/// Interrupt-then-kill escalation for one process.
#[derive(Debug, Clone)]
struct Terminator {
    pid: u32,
    tree: Arc<dyn ProcessTree>,
    exit: Arc<ExitLatch>,
    grace: Duration,
}

impl Terminator {
    fn terminate(&self) -> io::Result<()> {
        let interrupted = self.tree.interrupt(self.pid);
        if let Err(err) = &interrupted {
            tracing::warn!(pid = self.pid, error = %err, "failed to interrupt agent process tree");
        }

        let escalation = self.clone();
        thread::spawn(move || {
            if escalation.exit.wait_timeout(escalation.grace) {
                return;
            }
            tracing::warn!(
                pid = escalation.pid,
                grace_ms = escalation.grace.as_millis() as u64,
                "agent ignored interrupt; force killing process tree"
            );
            if let Err(err) = escalation.tree.kill(escalation.pid) {
                tracing::error!(pid = escalation.pid, error = %err, "failed to kill agent process tree");
            }
        });

        interrupted
    }
}

#[derive(Default)]
struct ProcState {
    child: Option<Child>,
    stdout: Option<AgentStream>,
    stderr: Option<AgentStream>,
    pid: Option<u32>,
    running: bool,
    cancel_requested: bool,
    exit: Arc<ExitLatch>,
}

/// A CLI coding agent invoked as `<executable> <args...> <prompt>`.
pub struct CliAgent {
    name: String,
    config: AgentConfig,
    tree: Arc<dyn ProcessTree>,
    grace: Duration,
    state: Mutex<ProcState>,
}

impl CliAgent {
    pub fn new(name: impl Into<String>, config: AgentConfig) -> Self {
        Self {
            name: name.into(),
            config,
            tree: default_process_tree(),
            grace: DEFAULT_GRACE_PERIOD,
            state: Mutex::new(ProcState::default()),
        }
    }

    /// `claude --print --dangerously-skip-permissions <prompt>` unless the
    /// config overrides executable or args.
    pub fn claude(config: AgentConfig) -> Self {
        Self::new("Claude Code", config)
    }

    pub fn with_process_tree(mut self, tree: Arc<dyn ProcessTree>) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn build_command(&self, prompt: &str) -> Command {
        let mut command = Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .arg(prompt)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.work_dir {
            command.current_dir(dir);
        }
        self.tree.prepare(&mut command);
        command
    }

    fn terminator(&self, state: &ProcState) -> Option<Terminator> {
        Some(Terminator {
            pid: state.pid?,
            tree: Arc::clone(&self.tree),
            exit: Arc::clone(&state.exit),
            grace: self.grace,
        })
    }
}

impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, cancel: &CancelToken, prompt: &str) -> Result<(), AgentError> {
        if prompt.trim().is_empty() {
            return Err(AgentError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }

        let mut state = self.lock();
        if state.running {
            return Err(AgentError::AlreadyRunning);
        }

        let mut child = self.build_command(prompt).spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                AgentError::NotFound {
                    name: self.config.executable.clone(),
                }
            } else {
                AgentError::Spawn {
                    message: format!("failed to start {}: {err}", self.config.executable),
                }
            }
        })?;

        let pid = child.id();
        *state = ProcState {
            stdout: child.stdout.take().map(|s| Box::new(s) as AgentStream),
            stderr: child.stderr.take().map(|s| Box::new(s) as AgentStream),
            child: Some(child),
            pid: Some(pid),
            running: true,
            cancel_requested: false,
            exit: Arc::new(ExitLatch::default()),
        };
        tracing::debug!(agent = %self.name, pid, "agent process started");

        let Some(terminator) = self.terminator(&state) else {
            return Ok(());
        };
        drop(state);

        // External cancellation and the optional run deadline both end in the
        // same interrupt-then-kill path.
        let cancel = cancel.clone();
        let deadline = self.config.timeout().map(|timeout| Instant::now() + timeout);
        thread::spawn(move || loop {
            if terminator.exit.wait_timeout(WATCH_INTERVAL) {
                return;
            }
            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if cancel.is_cancelled() || expired {
                if expired {
                    tracing::warn!(pid = terminator.pid, "agent run deadline reached");
                }
                let _ = terminator.terminate();
                return;
            }
        });

        Ok(())
    }

    fn take_stdout(&self) -> Option<AgentStream> {
        self.lock().stdout.take()
    }

    fn take_stderr(&self) -> Option<AgentStream> {
        self.lock().stderr.take()
    }

    fn wait(&self) -> Result<i32, AgentError> {
        let (mut child, exit) = {
            let mut state = self.lock();
            let child = state.child.take().ok_or(AgentError::NotStarted)?;
            (child, Arc::clone(&state.exit))
        };

        let status = child.wait();

        {
            let mut state = self.lock();
            state.running = false;
        }
        exit.set();

        let status = status.map_err(|err| AgentError::Runtime {
            message: err.to_string(),
        })?;
        Ok(status.code().unwrap_or(-1))
    }

    fn cancel(&self) -> Result<(), AgentError> {
        let terminator = {
            let mut state = self.lock();
            if !state.running || state.cancel_requested || state.exit.is_set() {
                return Ok(());
            }
            state.cancel_requested = true;
            self.terminator(&state)
        };

        match terminator {
            Some(terminator) => terminator.terminate().map_err(|err| AgentError::Signal {
                message: err.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }

    fn pid(&self) -> Option<u32> {
        self.lock().pid
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Mutex as StdMutex;

    fn sh_config(script: &str) -> AgentConfig {
        AgentConfig {
            name: "sh".to_string(),
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..AgentConfig::default()
        }
    }

    #[derive(Debug, Default)]
    struct RecordingTree {
        calls: StdMutex<Vec<&'static str>>,
    }

    impl ProcessTree for RecordingTree {
        fn prepare(&self, command: &mut Command) {
            crate::process_tree::ProcessGroup.prepare(command);
        }

        fn interrupt(&self, pid: u32) -> io::Result<()> {
            self.calls.lock().unwrap().push("interrupt");
            crate::process_tree::ProcessGroup.interrupt(pid)
        }

        fn kill(&self, pid: u32) -> io::Result<()> {
            self.calls.lock().unwrap().push("kill");
            crate::process_tree::ProcessGroup.kill(pid)
        }
    }

    #[test]
    fn start_rejects_empty_prompt_before_spawning() {
        let agent = CliAgent::new("sh", sh_config("exit 0"));
        let err = agent
            .start(&CancelToken::new(), "   ")
            .expect_err("empty prompt must fail");
        assert!(matches!(err, AgentError::InvalidRequest { .. }));
        assert!(!agent.is_running());
    }

    #[test]
    fn wait_before_start_is_not_started() {
        let agent = CliAgent::new("sh", sh_config("exit 0"));
        assert!(matches!(agent.wait(), Err(AgentError::NotStarted)));
    }

    #[test]
    fn missing_executable_maps_to_not_found() {
        let config = AgentConfig {
            executable: "/nonexistent/momentum-agent-bin".to_string(),
            ..AgentConfig::default()
        };
        let agent = CliAgent::new("missing", config);
        let err = agent
            .start(&CancelToken::new(), "do work")
            .expect_err("spawn must fail");
        assert!(matches!(err, AgentError::NotFound { .. }));
    }

    #[test]
    fn prompt_is_passed_as_last_argument() {
        // sh -c '<script>' <prompt> binds the prompt to $0.
        let agent = CliAgent::new("sh", sh_config("echo \"got: $0\""));
        agent.start(&CancelToken::new(), "fix the bug").expect("start");

        let mut out = String::new();
        agent
            .take_stdout()
            .expect("stdout")
            .read_to_string(&mut out)
            .expect("read stdout");
        assert_eq!(agent.wait().expect("wait"), 0);
        assert_eq!(out.trim(), "got: fix the bug");
    }

    #[test]
    fn starting_twice_while_running_fails() {
        let agent = CliAgent::new("sh", sh_config("sleep 5"));
        agent.start(&CancelToken::new(), "p").expect("first start");
        assert!(agent.is_running());
        assert!(agent.pid().is_some());

        let err = agent
            .start(&CancelToken::new(), "p")
            .expect_err("second start must fail");
        assert!(matches!(err, AgentError::AlreadyRunning));

        agent.cancel().expect("cancel");
        agent.wait().expect("wait");
        assert!(!agent.is_running());
    }

    #[test]
    fn wait_reports_non_zero_exit_code() {
        let agent = CliAgent::new("sh", sh_config("exit 3"));
        agent.start(&CancelToken::new(), "p").expect("start");
        assert_eq!(agent.wait().expect("wait"), 3);
    }

    #[test]
    fn cancel_escalates_to_kill_when_interrupt_is_ignored() {
        let tree = Arc::new(RecordingTree::default());
        let agent = CliAgent::new("sh", sh_config("trap '' INT; sleep 30"))
            .with_process_tree(tree.clone())
            .with_grace_period(Duration::from_millis(200));
        agent.start(&CancelToken::new(), "p").expect("start");
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        agent.cancel().expect("cancel returns immediately");
        assert!(started.elapsed() < Duration::from_secs(1));

        let code = agent.wait().expect("wait");
        assert_eq!(code, -1);
        assert_eq!(*tree.calls.lock().unwrap(), vec!["interrupt", "kill"]);
    }

    #[test]
    fn cancel_does_not_kill_a_process_that_exits_on_interrupt() {
        let tree = Arc::new(RecordingTree::default());
        let agent = CliAgent::new("sh", sh_config("sleep 30"))
            .with_process_tree(tree.clone())
            .with_grace_period(Duration::from_millis(300));
        agent.start(&CancelToken::new(), "p").expect("start");

        agent.cancel().expect("cancel");
        agent.wait().expect("wait");
        thread::sleep(Duration::from_millis(500));

        assert_eq!(*tree.calls.lock().unwrap(), vec!["interrupt"]);
    }

    #[test]
    fn external_cancel_token_stops_the_process() {
        let agent = CliAgent::new("sh", sh_config("sleep 30"))
            .with_grace_period(Duration::from_millis(200));
        let cancel = CancelToken::new();
        agent.start(&cancel, "p").expect("start");

        cancel.cancel();
        let started = Instant::now();
        agent.wait().expect("wait");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn run_deadline_triggers_cancellation() {
        let mut config = sh_config("sleep 30");
        config.timeout_secs = 1;
        let agent = CliAgent::new("sh", config).with_grace_period(Duration::from_millis(200));
        agent.start(&CancelToken::new(), "p").expect("start");

        let started = Instant::now();
        let code = agent.wait().expect("wait");
        assert_ne!(code, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
