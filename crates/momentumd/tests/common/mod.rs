#![allow(dead_code)]

use momentum_agents::{Agent, AgentError, AgentRegistry, AgentStream};
use momentum_board::FeedEvent;
use momentum_core::{AgentConfig, CancelToken, ExecutionMode, LifecycleMode, Scope};
use momentumd::SchedulerConfig;
use std::io::Cursor;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub use momentum_board::MemoryBoard;

pub const SCRIPTED_AGENT: &str = "scripted";

/// Agents that print the task id, then block until released or cancelled.
#[derive(Clone)]
pub struct AgentKit {
    release: CancelToken,
    exit_code: Arc<AtomicI32>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl AgentKit {
    pub fn new() -> Self {
        Self {
            release: CancelToken::new(),
            exit_code: Arc::new(AtomicI32::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Let every running and future agent exit with `exit_code`.
    pub fn release(&self, exit_code: i32) {
        self.exit_code.store(exit_code, Ordering::SeqCst);
        self.release.cancel();
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        let registry = AgentRegistry::empty();
        let kit = self.clone();
        registry.register(SCRIPTED_AGENT, move |_config: &AgentConfig| {
            Arc::new(ScriptedAgent {
                kit: kit.clone(),
                cancelled: CancelToken::new(),
                external: Mutex::new(None),
                task_id: Mutex::new(String::new()),
            }) as Arc<dyn Agent>
        });
        Arc::new(registry)
    }

    /// Task ids in start order.
    pub fn started(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|prompt| task_id_of(prompt))
            .collect()
    }
}

fn task_id_of(prompt: &str) -> Option<String> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("- Task ID: "))
        .map(str::to_string)
}

struct ScriptedAgent {
    kit: AgentKit,
    cancelled: CancelToken,
    external: Mutex<Option<CancelToken>>,
    task_id: Mutex<String>,
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        SCRIPTED_AGENT
    }

    fn start(&self, cancel: &CancelToken, prompt: &str) -> Result<(), AgentError> {
        *self.external.lock().unwrap() = Some(cancel.clone());
        *self.task_id.lock().unwrap() = task_id_of(prompt).unwrap_or_default();
        self.kit.prompts.lock().unwrap().push(prompt.to_string());
        Ok(())
    }

    fn take_stdout(&self) -> Option<AgentStream> {
        let line = format!("working on {}\n", self.task_id.lock().unwrap());
        Some(Box::new(Cursor::new(line.into_bytes())))
    }

    fn take_stderr(&self) -> Option<AgentStream> {
        None
    }

    fn wait(&self) -> Result<i32, AgentError> {
        let external = self.external.lock().unwrap().clone();
        loop {
            let shutdown = external.as_ref().is_some_and(CancelToken::is_cancelled);
            if shutdown || self.cancelled.wait_timeout(Duration::from_millis(10)) {
                return Ok(-1);
            }
            if self.kit.release.is_cancelled() {
                return Ok(self.kit.exit_code.load(Ordering::SeqCst));
            }
        }
    }

    fn cancel(&self) -> Result<(), AgentError> {
        self.cancelled.cancel();
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.cancelled.is_cancelled()
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

pub fn config(scope: Scope, mode: ExecutionMode, lifecycle: LifecycleMode) -> SchedulerConfig {
    let agent = AgentConfig {
        name: SCRIPTED_AGENT.to_string(),
        ..AgentConfig::default()
    };
    SchedulerConfig {
        scope,
        execution_mode: mode,
        lifecycle,
        agent,
        instructions: None,
        idle_poll_interval: Duration::from_millis(100),
        error_retry_delay: Duration::from_millis(50),
        queue_pause: Duration::from_millis(10),
    }
}

pub fn auto_epic_event(kind: &str) -> FeedEvent {
    FeedEvent::new(kind, r#"{"epic":{"id":"auto","auto":true}}"#)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
