//! The dispatch loop.
//!
//! One worker thread selects tasks, dispatches them to agents and, when idle,
//! waits on the change feed or a periodic safety poll. Each dispatched task
//! gets an output forwarder and a completion thread; the completion thread
//! applies the lifecycle status and reports back over the control channel.

use momentum_agents::{AgentRegistry, AgentRunner, RunResult};
use momentum_board::{Board, FeedError, FeedEvent, FeedSubscriber};
use momentum_core::{
    AgentConfig, CancelToken, ExecutionMode, LifecycleMode, MomentumConfig, Scope, Task, TaskId,
    TaskStatus,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::lifecycle::{self, CompletionInput};
use crate::pending::PendingQueue;
use crate::prompt::build_prompt;
use crate::running::{RunningSet, StopOutcome, TaskRunState};
use crate::selector::{SelectError, TaskSelector};
use crate::status::{StatusKind, StatusSink};

/// Granularity of every blocking wait inside the worker.
pub const IDLE_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub scope: Scope,
    pub execution_mode: ExecutionMode,
    pub lifecycle: LifecycleMode,
    pub agent: AgentConfig,
    pub instructions: Option<String>,
    pub idle_poll_interval: Duration,
    pub error_retry_delay: Duration,
    pub queue_pause: Duration,
}

impl SchedulerConfig {
    pub fn new(scope: Scope, config: &MomentumConfig) -> Self {
        Self {
            scope,
            execution_mode: config.scheduler.execution_mode,
            lifecycle: config.scheduler.lifecycle,
            agent: config.agent.clone(),
            instructions: config.scheduler.instructions.clone(),
            idle_poll_interval: config.scheduler.idle_poll_interval(),
            error_retry_delay: config.scheduler.error_retry_delay(),
            queue_pause: config.scheduler.queue_pause(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    Set(ExecutionMode),
    Toggle,
}

enum Control {
    Mode(ModeRequest),
    Finished(TaskId),
}

struct Shared {
    running: RunningSet,
    pending: Mutex<PendingQueue>,
    /// Ids this process will not select again.
    settled: Mutex<HashSet<TaskId>>,
    mode: Mutex<ExecutionMode>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn settled(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.settled.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take a queued task off the queue for good.
    fn withdraw(&self, task_id: &TaskId) -> bool {
        let mut pending = self.pending();
        if pending.remove(task_id).is_none() {
            return false;
        }
        self.settled().insert(task_id.clone());
        true
    }

    fn mode(&self) -> ExecutionMode {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEntry {
    pub task_id: TaskId,
    pub state: TaskRunState,
}

/// Point-in-time view for the operator `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub scope: String,
    pub mode: ExecutionMode,
    pub running: Vec<TaskEntry>,
    pub queued: Vec<TaskId>,
}

pub struct Scheduler {
    board: Arc<dyn Board>,
    registry: Arc<AgentRegistry>,
    config: SchedulerConfig,
    status: StatusSink,
}

impl Scheduler {
    pub fn new(board: Arc<dyn Board>, registry: Arc<AgentRegistry>, config: SchedulerConfig) -> Self {
        Self {
            board,
            registry,
            config,
            status: StatusSink::disabled(),
        }
    }

    pub fn with_status(mut self, status: StatusSink) -> Self {
        self.status = status;
        self
    }

    /// Start the worker fed by an existing event stream.
    pub fn spawn(self, events: Receiver<FeedEvent>) -> SchedulerHandle {
        self.launch(events, None, CancelToken::new())
    }

    /// Start `feed` and the worker together. The feed is stopped first on
    /// shutdown.
    pub fn spawn_with_feed(self, feed: FeedSubscriber) -> Result<SchedulerHandle, FeedError> {
        let shutdown = CancelToken::new();
        let events = feed.start(&shutdown)?;
        Ok(self.launch(events, Some(feed), shutdown))
    }

    fn launch(
        self,
        events: Receiver<FeedEvent>,
        feed: Option<FeedSubscriber>,
        shutdown: CancelToken,
    ) -> SchedulerHandle {
        let shared = Arc::new(Shared {
            running: RunningSet::new(),
            pending: Mutex::new(PendingQueue::new()),
            settled: Mutex::new(HashSet::new()),
            mode: Mutex::new(self.config.execution_mode),
        });
        let (control_tx, control_rx) = mpsc::channel();
        let scope = self.config.scope.clone();
        let worker = Worker {
            selector: TaskSelector::new(Arc::clone(&self.board), self.config.scope.clone()),
            board: self.board,
            registry: self.registry,
            config: self.config,
            status: self.status,
            shared: Arc::clone(&shared),
            control_tx: control_tx.clone(),
            control_rx,
            events,
            feed,
            shutdown: shutdown.clone(),
        };
        let join = thread::spawn(move || worker.run());

        SchedulerHandle {
            shared,
            scope,
            control: control_tx,
            shutdown,
            worker: Arc::new(Mutex::new(Some(join))),
        }
    }
}

/// Operator control surface. Cheap to clone; every clone drives the same
/// worker.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    scope: Scope,
    control: Sender<Control>,
    shutdown: CancelToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    pub fn set_mode(&self, mode: ExecutionMode) {
        self.send(Control::Mode(ModeRequest::Set(mode)));
    }

    pub fn toggle_mode(&self) {
        self.send(Control::Mode(ModeRequest::Toggle));
    }

    fn send(&self, message: Control) {
        if self.control.send(message).is_err() {
            tracing::debug!("scheduler already stopped; control message ignored");
        }
    }

    /// Mode as last applied by the worker.
    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode()
    }

    /// Stop the agent working on `task_id`. When it exits the task goes back
    /// to planning. A task still waiting in the sync queue is dequeued and
    /// not selected again by this process.
    pub fn request_stop(&self, task_id: &TaskId) -> StopOutcome {
        let mut outcome = self.shared.running.request_stop(task_id);
        if outcome == StopOutcome::NotRunning && self.shared.withdraw(task_id) {
            outcome = StopOutcome::Dequeued;
        }
        match outcome {
            StopOutcome::Requested => tracing::info!(task_id = %task_id, "stop requested"),
            StopOutcome::AlreadyRequested => {
                tracing::debug!(task_id = %task_id, "stop already requested")
            }
            StopOutcome::Dequeued => tracing::info!(task_id = %task_id, "queued task withdrawn"),
            StopOutcome::NotRunning => {
                tracing::warn!(task_id = %task_id, "stop ignored: task is not running")
            }
        }
        outcome
    }

    /// Ask the worker to stop. Returns immediately; use [`SchedulerHandle::wait`]
    /// to block until every agent has exited.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Block until the worker thread has exited.
    pub fn wait(&self) {
        let join = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("scheduler worker panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.shared.running.running_ids()
    }

    pub fn queued_tasks(&self) -> Vec<TaskId> {
        self.shared.pending().ids()
    }

    pub fn task_state(&self, task_id: &TaskId) -> TaskRunState {
        match self.shared.running.state(task_id) {
            TaskRunState::Idle if self.shared.pending().contains(task_id) => TaskRunState::Queued,
            state => state,
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let running = self
            .shared
            .running
            .running_ids()
            .into_iter()
            .map(|task_id| TaskEntry {
                state: self.shared.running.state(&task_id),
                task_id,
            })
            .collect();
        SchedulerSnapshot {
            scope: self.scope.describe(),
            mode: self.mode(),
            running,
            queued: self.queued_tasks(),
        }
    }
}

struct Worker {
    board: Arc<dyn Board>,
    selector: TaskSelector,
    registry: Arc<AgentRegistry>,
    config: SchedulerConfig,
    status: StatusSink,
    shared: Arc<Shared>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    events: Receiver<FeedEvent>,
    feed: Option<FeedSubscriber>,
    shutdown: CancelToken,
}

impl Worker {
    fn run(self) {
        tracing::info!(
            scope = %self.config.scope.describe(),
            mode = %self.shared.mode(),
            lifecycle = %self.config.lifecycle,
            "scheduler started"
        );

        while !self.shutdown.is_cancelled() {
            self.drain_control();
            let mode = self.shared.mode();

            if mode == ExecutionMode::Sync
                && !self.shared.pending().is_empty()
                && !self.shared.running.has_running()
            {
                self.dispatch_next_pending();
                self.pause(self.config.queue_pause);
                continue;
            }

            match self.selector.select_excluding(&self.excluded()) {
                Ok(task) => self.handle_selected(task, mode),
                Err(err) if err.is_none_available() => {
                    if self.shared.pending().is_empty() {
                        self.wait_for_work();
                    } else {
                        self.pause(self.config.queue_pause);
                    }
                }
                Err(err) => {
                    self.report_error(&err);
                    self.pause(self.config.error_retry_delay);
                }
            }
        }

        self.stop_everything();
    }

    fn pause(&self, duration: Duration) {
        self.shutdown.wait_timeout(duration);
    }

    /// Apply queued control messages. Returns true if there were any.
    fn drain_control(&self) -> bool {
        let mut handled = false;
        while let Ok(message) = self.control_rx.try_recv() {
            handled = true;
            match message {
                Control::Mode(request) => self.apply_mode(request),
                Control::Finished(task_id) => {
                    tracing::debug!(task_id = %task_id, "agent slot released");
                }
            }
        }
        handled
    }

    fn apply_mode(&self, request: ModeRequest) {
        let mode = {
            let mut current = self.shared.mode.lock().unwrap_or_else(|p| p.into_inner());
            let next = match request {
                ModeRequest::Set(mode) => mode,
                ModeRequest::Toggle => current.toggle(),
            };
            if *current == next {
                return;
            }
            *current = next;
            next
        };
        tracing::info!(mode = %mode, "execution mode changed");
        self.status.emit(StatusKind::ModeChanged { mode });

        if mode == ExecutionMode::Async {
            let queued = self.shared.pending().drain_all();
            for task in queued {
                self.dispatch(task);
            }
        }
    }

    /// Ids the selector must skip: queued, running and settled.
    fn excluded(&self) -> HashSet<TaskId> {
        let mut excluded: HashSet<TaskId> = self.shared.pending().ids().into_iter().collect();
        excluded.extend(self.shared.running.running_ids());
        excluded.extend(self.shared.settled().iter().cloned());
        excluded
    }

    fn handle_selected(&self, task: Task, mode: ExecutionMode) {
        match mode {
            ExecutionMode::Async => {
                if !self.dispatch(task) {
                    self.pause(self.config.error_retry_delay);
                }
            }
            ExecutionMode::Sync if self.shared.running.has_running() => {
                self.enqueue(task);
                self.pause(self.config.queue_pause);
            }
            ExecutionMode::Sync => {
                self.enqueue(task);
                self.dispatch_next_pending();
            }
        }
    }

    fn enqueue(&self, task: Task) {
        let task_id = task.id.clone();
        let position = {
            let mut pending = self.shared.pending();
            if !pending.push(task) {
                return;
            }
            pending.len()
        };
        tracing::info!(task_id = %task_id, position, "task queued");
        self.status.emit(StatusKind::Queued { task_id, position });
    }

    fn dispatch_next_pending(&self) {
        if self.shared.running.has_running() {
            return;
        }
        let next = self.shared.pending().pop_front();
        if let Some(task) = next {
            if !self.dispatch(task) {
                self.pause(self.config.error_retry_delay);
            }
        }
    }

    /// Block until the selector would return something, a control message
    /// arrives, or shutdown. Only auto-epic board changes and the periodic
    /// poll trigger a re-check.
    fn wait_for_work(&self) {
        let mut next_poll = Instant::now() + self.config.idle_poll_interval;
        loop {
            if self.shutdown.is_cancelled() || self.drain_control() {
                return;
            }

            let woken = match self.events.recv_timeout(IDLE_SLICE) {
                Ok(event) => {
                    let wakes = event.wakes_scheduler();
                    tracing::debug!(kind = %event.kind, wakes, "feed event");
                    wakes
                }
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => {
                    self.pause(IDLE_SLICE);
                    false
                }
            };

            let poll_due = Instant::now() >= next_poll;
            if poll_due {
                next_poll = Instant::now() + self.config.idle_poll_interval;
            }
            if (woken || poll_due) && self.selector.select_excluding(&self.excluded()).is_ok() {
                return;
            }
        }
    }

    fn report_error(&self, err: &SelectError) {
        tracing::error!(error = %err, "task selection failed");
        self.status.emit(StatusKind::Error {
            message: err.to_string(),
        });
    }

    fn fail(&self, task: &Task, message: String) {
        tracing::error!(task_id = %task.id, "{message}");
        self.status.emit(StatusKind::Failed {
            task_id: task.id.clone(),
            message,
        });
    }

    /// Start an agent for `task`. Returns false if the task could not be
    /// started; a task that is already running counts as started.
    fn dispatch(&self, task: Task) -> bool {
        self.shared.pending().remove(&task.id);
        let running = &self.shared.running;
        if !running.try_claim(&task.id) {
            tracing::debug!(task_id = %task.id, "task already running; duplicate dispatch ignored");
            return true;
        }

        let agent = match self.registry.create(&self.config.agent.name, &self.config.agent) {
            Ok(agent) => agent,
            Err(err) => {
                running.release(&task.id);
                self.fail(&task, format!("failed to create agent: {err}"));
                return false;
            }
        };

        if let Some(status) = lifecycle::dispatch_status(self.config.lifecycle) {
            if let Err(err) = lifecycle::transition(self.board.as_ref(), &task, status) {
                running.release(&task.id);
                self.fail(&task, format!("failed to start task: {err}"));
                return false;
            }
        }

        let agent_name = agent.name().to_string();
        let runner = Arc::new(AgentRunner::new(agent));
        let Some(done) = runner.done() else {
            running.release(&task.id);
            self.fail(&task, "agent runner has no completion channel".to_string());
            return false;
        };

        let prompt = build_prompt(&task, self.config.instructions.as_deref());
        if let Err(err) = runner.run(&self.shutdown, &prompt) {
            running.release(&task.id);
            self.fail(&task, format!("failed to start agent: {err}"));
            return false;
        }
        // Applies a stop that arrived while the agent was starting.
        running.attach(&task.id, Arc::clone(&runner));

        tracing::info!(task_id = %task.id, agent = %agent_name, "dispatched {}", task.title);
        self.status.emit(StatusKind::Dispatched {
            task_id: task.id.clone(),
            title: task.title.clone(),
            agent: agent_name,
        });

        self.forward_output(&task.id, &runner);
        self.await_completion(task, done);
        true
    }

    fn forward_output(&self, task_id: &TaskId, runner: &AgentRunner) {
        let output = runner.output();
        let status = self.status.clone();
        let task_id = task_id.clone();
        thread::spawn(move || {
            for line in output.iter() {
                tracing::trace!(task_id = %task_id, stderr = line.is_stderr, "{}", line.text);
                status.emit(StatusKind::Output {
                    task_id: task_id.clone(),
                    line: line.text,
                    is_stderr: line.is_stderr,
                });
            }
        });
    }

    fn await_completion(&self, task: Task, done: Receiver<RunResult>) {
        let board = Arc::clone(&self.board);
        let shared = Arc::clone(&self.shared);
        let status = self.status.clone();
        let control = self.control_tx.clone();
        let lifecycle = self.config.lifecycle;
        let settle = settles_after_run(&self.config.scope, lifecycle);
        thread::spawn(move || {
            let result = done.recv().unwrap_or(RunResult {
                exit_code: -1,
                duration: Duration::ZERO,
                error: None,
            });
            let running = &shared.running;
            let stopped_by_operator = running.state(&task.id) == TaskRunState::CancelRequested;
            let new_status = lifecycle::completion_status(CompletionInput {
                stopped_by_operator,
                exit_code: result.exit_code,
                lifecycle,
            });
            // Write and settle before releasing the slot, so shutdown waits
            // for the write and the selector never sees the task unclaimed.
            let new_status = new_status.and_then(|target| {
                lifecycle::transition(board.as_ref(), &task, target)
                    .ok()
                    .map(|_| target)
            });
            if settle {
                shared.settled().insert(task.id.clone());
            }
            running.finish(&task.id);

            report_completion(&status, &task, &result, stopped_by_operator, new_status);
            let _ = control.send(Control::Finished(task.id));
        });
    }

    fn stop_everything(self) {
        tracing::info!("scheduler shutting down");
        if let Some(feed) = &self.feed {
            feed.stop();
        }
        let cancelled = self.shared.running.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "waiting for agents to exit");
        }
        while !self.shared.running.is_empty() {
            thread::sleep(IDLE_SLICE);
        }
        tracing::info!("scheduler stopped");
    }
}

/// Whether a task that has run once stays out of selection. A single-task
/// scope runs its task once. When the agent owns the lifecycle, a run that
/// left the task `todo` would otherwise be picked again immediately.
fn settles_after_run(scope: &Scope, lifecycle: LifecycleMode) -> bool {
    matches!(scope, Scope::Task(_)) || lifecycle == LifecycleMode::Agent
}

fn report_completion(
    status: &StatusSink,
    task: &Task,
    result: &RunResult,
    stopped_by_operator: bool,
    new_status: Option<TaskStatus>,
) {
    let duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX);
    if stopped_by_operator {
        tracing::info!(task_id = %task.id, "agent stopped by operator");
    } else if result.success() {
        tracing::info!(task_id = %task.id, duration_ms, "agent finished");
    } else {
        let message = match &result.error {
            Some(err) => format!("agent failed: {err}"),
            None => format!("agent exited with code {}", result.exit_code),
        };
        tracing::warn!(task_id = %task.id, exit_code = result.exit_code, "{message}");
        status.emit(StatusKind::Failed {
            task_id: task.id.clone(),
            message,
        });
    }
    status.emit(StatusKind::Completed {
        task_id: task.id.clone(),
        exit_code: result.exit_code,
        duration_ms,
        stopped_by_operator,
        new_status,
    });
}
