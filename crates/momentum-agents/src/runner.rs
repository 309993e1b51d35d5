//! One-shot run of an [`Agent`] with line streaming and a completion signal.

use chrono::Utc;
use momentum_core::CancelToken;
use std::io::{BufRead, BufReader, ErrorKind};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::agent::{Agent, AgentStream};
use crate::error::AgentError;
use crate::queue::{OutputQueue, DEFAULT_OUTPUT_CAPACITY};
use crate::types::{OutputLine, RunResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerPhase {
    Idle,
    Running,
    Finished,
}

struct RunnerState {
    phase: RunnerPhase,
    done_tx: Option<SyncSender<RunResult>>,
    done_rx: Option<Receiver<RunResult>>,
}

pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    output: OutputQueue,
    state: Arc<Mutex<RunnerState>>,
}

impl AgentRunner {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self::with_capacity(agent, DEFAULT_OUTPUT_CAPACITY)
    }

    pub fn with_capacity(agent: Arc<dyn Agent>, output_capacity: usize) -> Self {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        Self {
            agent,
            output: OutputQueue::new(output_capacity),
            state: Arc::new(Mutex::new(RunnerState {
                phase: RunnerPhase::Idle,
                done_tx: Some(done_tx),
                done_rx: Some(done_rx),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start the agent and return once it is running. Output and completion
    /// are delivered through [`AgentRunner::output`] and [`AgentRunner::done`].
    pub fn run(&self, cancel: &CancelToken, prompt: &str) -> Result<(), AgentError> {
        let done_tx = {
            let mut state = self.lock();
            match state.phase {
                RunnerPhase::Running => return Err(AgentError::AlreadyRunning),
                RunnerPhase::Finished => return Err(AgentError::RunnerSpent),
                RunnerPhase::Idle => {}
            }
            state.phase = RunnerPhase::Running;
            state.done_tx.take()
        };
        let Some(done_tx) = done_tx else {
            return Err(AgentError::RunnerSpent);
        };

        let started_at = Instant::now();
        if let Err(err) = self.agent.start(cancel, prompt) {
            let mut state = self.lock();
            state.phase = RunnerPhase::Idle;
            state.done_tx = Some(done_tx);
            return Err(err);
        }

        let readers: Vec<JoinHandle<()>> = [
            (self.agent.take_stdout(), false),
            (self.agent.take_stderr(), true),
        ]
        .into_iter()
        .filter_map(|(stream, is_stderr)| {
            let stream = stream?;
            let output = self.output.clone();
            Some(thread::spawn(move || stream_lines(stream, is_stderr, &output)))
        })
        .collect();

        let agent = Arc::clone(&self.agent);
        let output = self.output.clone();
        let state = Arc::clone(&self.state);
        thread::spawn(move || {
            let (exit_code, error) = match agent.wait() {
                Ok(code) => (code, None),
                Err(err) => (-1, Some(err)),
            };
            for reader in readers {
                let _ = reader.join();
            }

            state.lock().unwrap_or_else(|p| p.into_inner()).phase = RunnerPhase::Finished;
            let _ = done_tx.send(RunResult {
                exit_code,
                duration: started_at.elapsed(),
                error,
            });
            output.close();
            drop(done_tx);
        });

        Ok(())
    }

    /// Consumer handle for streamed output. Closed after the run completes.
    pub fn output(&self) -> OutputQueue {
        self.output.clone()
    }

    /// The completion receiver. Yields exactly one [`RunResult`]; only the
    /// first caller gets it.
    pub fn done(&self) -> Option<Receiver<RunResult>> {
        self.lock().done_rx.take()
    }

    pub fn cancel(&self) -> Result<(), AgentError> {
        self.agent.cancel()
    }

    pub fn is_running(&self) -> bool {
        self.lock().phase == RunnerPhase::Running
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }
}

fn stream_lines(stream: AgentStream, is_stderr: bool, output: &OutputQueue) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = OutputLine {
                    text: String::from_utf8_lossy(&buf).into_owned(),
                    is_stderr,
                    at: Utc::now(),
                };
                if output.push(line) {
                    tracing::trace!(is_stderr, "output queue full; dropped oldest line");
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(is_stderr, error = %err, "agent output stream ended with error");
                break;
            }
        }
    }
}
