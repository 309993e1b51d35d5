mod common;

use common::{auto_epic_event, config, wait_until, AgentKit, MemoryBoard};
use momentum_board::FeedEvent;
use momentum_core::{ExecutionMode, LifecycleMode, Scope, TaskId, TaskStatus};
use momentumd::{
    execute, OperatorCommand, Scheduler, SchedulerConfig, SchedulerHandle, StatusEvent,
    StatusKind, StatusSink, StopOutcome, TaskRunState,
};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    handle: SchedulerHandle,
    events: SyncSender<FeedEvent>,
    status: Receiver<StatusEvent>,
}

fn start(board: &Arc<MemoryBoard>, kit: &AgentKit, config: SchedulerConfig) -> Harness {
    let (events, rx) = mpsc::sync_channel(100);
    let (sink, status) = StatusSink::channel(1_000);
    let handle = Scheduler::new(board.clone(), kit.registry(), config)
        .with_status(sink)
        .spawn(rx);
    Harness {
        handle,
        events,
        status,
    }
}

impl Harness {
    fn stop(self) {
        self.handle.shutdown();
        self.handle.wait();
        assert!(self.handle.is_finished());
        assert!(self.handle.running_tasks().is_empty());
    }

    /// Collect status events until one matches or the timeout passes.
    fn wait_for_status(&self, mut matches: impl FnMut(&StatusKind) -> bool) -> Vec<StatusKind> {
        let deadline = Instant::now() + TIMEOUT;
        let mut seen = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.status.recv_timeout(left) {
                Ok(event) => {
                    let hit = matches(&event.kind);
                    seen.push(event.kind);
                    if hit {
                        return seen;
                    }
                }
                Err(_) => break,
            }
        }
        panic!("status event not seen; got {seen:?}");
    }
}

fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::new(*id)).collect()
}

#[test]
fn duplicate_change_events_dispatch_a_running_task_once() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Agent),
    );

    assert!(wait_until(TIMEOUT, || kit.started().len() == 1));
    for _ in 0..20 {
        harness
            .events
            .send(auto_epic_event("task.updated"))
            .expect("send event");
    }
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(kit.started(), vec!["t1"]);
    assert_eq!(harness.handle.task_state(&TaskId::new("t1")), TaskRunState::Running);
    harness.stop();
    assert!(board.status_writes().is_empty());
}

#[test]
fn switching_sync_to_async_dispatches_every_queued_task() {
    let board = MemoryBoard::with_epics();
    for id in ["t1", "t2", "t3", "t4"] {
        board.add_task(id, "p1", Some("auto"), TaskStatus::Todo);
    }
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Sync, LifecycleMode::Orchestrator),
    );

    assert!(wait_until(TIMEOUT, || harness.handle.queued_tasks().len() == 3));
    assert_eq!(kit.started(), vec!["t4"]);
    assert_eq!(harness.handle.queued_tasks(), ids(&["t3", "t2", "t1"]));
    assert_eq!(harness.handle.task_state(&TaskId::new("t3")), TaskRunState::Queued);
    let snapshot = harness.handle.snapshot();
    assert_eq!(snapshot.mode, ExecutionMode::Sync);
    assert_eq!(snapshot.scope, "All projects");
    assert_eq!(snapshot.running.len(), 1);

    harness.handle.set_mode(ExecutionMode::Async);
    assert!(wait_until(TIMEOUT, || kit.started().len() == 4));
    assert_eq!(kit.started(), vec!["t4", "t3", "t2", "t1"]);
    assert!(harness.handle.queued_tasks().is_empty());
    assert_eq!(harness.handle.running_tasks(), ids(&["t1", "t2", "t3", "t4"]));
    assert_eq!(harness.handle.mode(), ExecutionMode::Async);

    kit.release(0);
    assert!(wait_until(TIMEOUT, || {
        ["t1", "t2", "t3", "t4"]
            .iter()
            .all(|id| board.status_of(id) == Some(TaskStatus::Done))
    }));
    for id in ["t1", "t2", "t3", "t4"] {
        assert_eq!(
            board.writes_for(id),
            vec![TaskStatus::InProgress, TaskStatus::Done]
        );
    }
    harness.stop();
}

#[test]
fn sync_mode_runs_queued_tasks_one_after_another() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    board.add_task("t2", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Sync, LifecycleMode::Orchestrator),
    );

    assert!(wait_until(TIMEOUT, || harness.handle.queued_tasks() == ids(&["t1"])));
    assert_eq!(harness.handle.running_tasks(), ids(&["t2"]));

    kit.release(0);
    assert!(wait_until(TIMEOUT, || board.status_of("t1") == Some(TaskStatus::Done)));
    assert_eq!(kit.started(), vec!["t2", "t1"]);
    assert_eq!(board.status_of("t2"), Some(TaskStatus::Done));
    harness.stop();
}

#[test]
fn failed_run_leaves_task_in_progress_and_reports_failure() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    kit.release(3);
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator),
    );

    let seen = harness.wait_for_status(|kind| matches!(kind, StatusKind::Completed { .. }));
    assert!(seen.iter().any(|kind| matches!(
        kind,
        StatusKind::Dispatched { task_id, agent, .. } if task_id.0 == "t1" && agent == "scripted"
    )));
    assert!(seen.iter().any(|kind| matches!(
        kind,
        StatusKind::Failed { message, .. } if message.contains("exited with code 3")
    )));
    assert!(matches!(
        seen.last(),
        Some(StatusKind::Completed {
            exit_code: 3,
            stopped_by_operator: false,
            new_status: None,
            ..
        })
    ));
    assert_eq!(board.writes_for("t1"), vec![TaskStatus::InProgress]);
    assert_eq!(board.status_of("t1"), Some(TaskStatus::InProgress));
    harness.stop();
}

#[test]
fn agent_output_is_forwarded_as_status() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator),
    );

    harness.wait_for_status(|kind| {
        matches!(kind, StatusKind::Output { line, is_stderr: false, .. } if line == "working on t1")
    });
    harness.stop();
}

#[test]
fn operator_stop_resets_task_to_planning() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator),
    );

    assert!(wait_until(TIMEOUT, || kit.started().len() == 1));
    let t1 = TaskId::new("t1");
    assert_eq!(harness.handle.request_stop(&t1), StopOutcome::Requested);

    assert!(wait_until(TIMEOUT, || board.status_of("t1") == Some(TaskStatus::Planning)));
    assert_eq!(
        board.writes_for("t1"),
        vec![TaskStatus::InProgress, TaskStatus::Planning]
    );
    assert!(wait_until(TIMEOUT, || harness.handle.task_state(&t1) == TaskRunState::Completed));
    assert_eq!(harness.handle.request_stop(&t1), StopOutcome::NotRunning);
    harness.stop();
}

#[test]
fn operator_stop_applies_planning_even_when_agent_owns_lifecycle() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Agent),
    );

    assert!(wait_until(TIMEOUT, || kit.started().len() == 1));
    let reply = execute(&harness.handle, OperatorCommand::Stop(TaskId::new("t1")));
    assert_eq!(reply, "stopping t1");

    assert!(wait_until(TIMEOUT, || board.status_of("t1") == Some(TaskStatus::Planning)));
    assert_eq!(board.writes_for("t1"), vec![TaskStatus::Planning]);
    harness.stop();
}

#[test]
fn task_scope_runs_the_task_once_in_any_status() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("manual"), TaskStatus::Done);
    let kit = AgentKit::new();
    kit.release(0);
    let harness = start(
        &board,
        &kit,
        config(
            Scope::Task(TaskId::new("t1")),
            ExecutionMode::Async,
            LifecycleMode::Orchestrator,
        ),
    );

    assert!(wait_until(TIMEOUT, || board.writes_for("t1").len() == 2));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(kit.started(), vec!["t1"]);
    assert_eq!(
        board.writes_for("t1"),
        vec![TaskStatus::InProgress, TaskStatus::Done]
    );
    assert_eq!(
        harness.handle.task_state(&TaskId::new("t1")),
        TaskRunState::Completed
    );
    harness.stop();
}

#[test]
fn agent_lifecycle_makes_no_status_writes_on_success() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    kit.release(0);
    let harness = start(
        &board,
        &kit,
        config(
            Scope::Task(TaskId::new("t1")),
            ExecutionMode::Async,
            LifecycleMode::Agent,
        ),
    );

    let seen = harness.wait_for_status(|kind| matches!(kind, StatusKind::Completed { .. }));
    assert!(matches!(
        seen.last(),
        Some(StatusKind::Completed {
            exit_code: 0,
            new_status: None,
            ..
        })
    ));
    assert!(board.status_writes().is_empty());
    harness.stop();
}

#[test]
fn only_auto_epic_change_events_wake_the_idle_scheduler() {
    let board = MemoryBoard::with_epics();
    let kit = AgentKit::new();
    let mut settings = config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator);
    settings.idle_poll_interval = Duration::from_secs(60);
    let harness = start(&board, &kit, settings);

    std::thread::sleep(Duration::from_millis(200));
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    harness
        .events
        .send(FeedEvent::new("task.created", r#"{"epic":{"auto":false}}"#))
        .expect("send");
    harness
        .events
        .send(FeedEvent::polling_refresh())
        .expect("send");
    std::thread::sleep(Duration::from_millis(300));
    assert!(kit.started().is_empty());

    harness
        .events
        .send(auto_epic_event("task.created"))
        .expect("send");
    assert!(wait_until(TIMEOUT, || kit.started() == vec!["t1"]));
    harness.stop();
}

#[test]
fn periodic_poll_picks_up_new_work_without_events() {
    let board = MemoryBoard::with_epics();
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator),
    );

    std::thread::sleep(Duration::from_millis(150));
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    assert!(wait_until(TIMEOUT, || kit.started() == vec!["t1"]));
    harness.stop();
}

#[test]
fn shutdown_cancels_running_agents_before_returning() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    board.add_task("t2", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator),
    );

    assert!(wait_until(TIMEOUT, || harness.handle.running_tasks().len() == 2));
    let handle = harness.handle.clone();
    harness.stop();

    assert!(handle.is_shutting_down());
    for id in ["t1", "t2"] {
        assert_eq!(board.writes_for(id), vec![TaskStatus::InProgress]);
    }
}

#[test]
fn unknown_agent_is_reported_and_not_started() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let mut settings = config(Scope::Global, ExecutionMode::Async, LifecycleMode::Orchestrator);
    settings.agent.name = "missing".to_string();
    let harness = start(&board, &kit, settings);

    harness.wait_for_status(|kind| {
        matches!(kind, StatusKind::Failed { message, .. } if message.contains("failed to create agent"))
    });
    assert!(kit.started().is_empty());
    assert!(board.status_writes().is_empty());
    assert_eq!(harness.handle.task_state(&TaskId::new("t1")), TaskRunState::Idle);
    harness.stop();
}

#[test]
fn agent_lifecycle_does_not_rerun_a_failed_task() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    kit.release(1);
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Async, LifecycleMode::Agent),
    );

    let seen = harness.wait_for_status(|kind| matches!(kind, StatusKind::Completed { .. }));
    assert!(seen.iter().any(|kind| matches!(kind, StatusKind::Failed { .. })));
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(kit.started(), vec!["t1"]);
    assert_eq!(board.status_of("t1"), Some(TaskStatus::Todo));
    assert!(board.status_writes().is_empty());
    harness.stop();
}

#[test]
fn agent_lifecycle_runs_each_task_once_across_a_project() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    board.add_task("t2", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    kit.release(0);
    let harness = start(
        &board,
        &kit,
        config(
            Scope::Project(momentum_core::ProjectId::new("p1")),
            ExecutionMode::Sync,
            LifecycleMode::Agent,
        ),
    );

    assert!(wait_until(TIMEOUT, || kit.started().len() == 2));
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(kit.started(), vec!["t2", "t1"]);
    assert!(board.status_writes().is_empty());
    harness.stop();
}

#[test]
fn stopping_a_queued_task_takes_it_off_the_queue() {
    let board = MemoryBoard::with_epics();
    board.add_task("t1", "p1", Some("auto"), TaskStatus::Todo);
    board.add_task("t2", "p1", Some("auto"), TaskStatus::Todo);
    let kit = AgentKit::new();
    let harness = start(
        &board,
        &kit,
        config(Scope::Global, ExecutionMode::Sync, LifecycleMode::Orchestrator),
    );

    assert!(wait_until(TIMEOUT, || harness.handle.queued_tasks() == ids(&["t1"])));
    let reply = execute(&harness.handle, OperatorCommand::Stop(TaskId::new("t1")));
    assert_eq!(reply, "removed t1 from the queue");
    assert!(harness.handle.queued_tasks().is_empty());

    kit.release(0);
    assert!(wait_until(TIMEOUT, || board.status_of("t2") == Some(TaskStatus::Done)));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(kit.started(), vec!["t2"]);
    assert_eq!(board.status_of("t1"), Some(TaskStatus::Todo));
    assert_eq!(
        harness.handle.request_stop(&TaskId::new("t1")),
        StopOutcome::NotRunning
    );
    harness.stop();
}
