use clap::{Parser, ValueEnum};
use momentum_agents::AgentRegistry;
use momentum_board::{BoardError, FeedError, FeedSubscriber, HttpBoard};
use momentum_core::{
    load_config, ConfigError, ExecutionMode, LifecycleMode, MomentumConfig, Scope, Validate,
    ValidationLevel, DEFAULT_CONFIG_FILE,
};
use momentumd::{
    execute, parse_command, render_status, CommandError, OperatorCommand, Scheduler,
    SchedulerConfig, SchedulerHandle, StatusEvent, StatusSink, STATUS_CHANNEL_CAPACITY,
};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Async,
    Sync,
}

impl From<ModeArg> for ExecutionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Async => ExecutionMode::Async,
            ModeArg::Sync => ExecutionMode::Sync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LifecycleArg {
    Orchestrator,
    Agent,
}

impl From<LifecycleArg> for LifecycleMode {
    fn from(value: LifecycleArg) -> Self {
        match value {
            LifecycleArg::Orchestrator => LifecycleMode::Orchestrator,
            LifecycleArg::Agent => LifecycleMode::Agent,
        }
    }
}

/// Watch a task board and hand each actionable task to a coding agent.
#[derive(Debug, Parser)]
#[command(name = "momentum", version, about)]
struct Cli {
    /// Board base URL (overrides the config file)
    #[arg(long)]
    base_url: Option<String>,

    /// Run exactly this task
    #[arg(long, conflicts_with_all = ["epic", "project"])]
    task: Option<String>,

    /// Only pick tasks from this epic
    #[arg(long, conflicts_with = "project")]
    epic: Option<String>,

    /// Only pick tasks from this project
    #[arg(long)]
    project: Option<String>,

    /// Dispatch every task at once (async) or one at a time (sync)
    #[arg(long, value_enum)]
    execution_mode: Option<ModeArg>,

    /// Working directory for agent processes
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Who moves tasks between statuses
    #[arg(long, value_enum)]
    lifecycle: Option<LifecycleArg>,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid configuration:\n{0}")]
    InvalidConfig(String),
    #[error("unknown agent '{name}' (available: {available})")]
    UnknownAgent { name: String, available: String },
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("failed to install signal handler: {source}")]
    Signals {
        #[source]
        source: io::Error,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("momentum failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MainError> {
    let cli = Cli::parse();
    init_logging();

    let mut config = load_config(&cli.config)?;
    apply_overrides(&mut config, &cli);
    check_config(&config)?;
    let scope = Scope::from_filters(cli.task, cli.epic, cli.project).map_err(MainError::Args)?;

    let registry = Arc::new(AgentRegistry::new());
    if !registry.has(&config.agent.name) {
        return Err(MainError::UnknownAgent {
            name: config.agent.name.clone(),
            available: registry.available().join(", "),
        });
    }

    let board = HttpBoard::from_config(&config.board)?;
    let feed = FeedSubscriber::http(&config.board.base_url, config.feed.clone())?;

    tracing::info!(
        criteria = %scope.describe(),
        base_url = %board.base_url(),
        mode = %config.scheduler.execution_mode,
        lifecycle = %config.scheduler.lifecycle,
        agent = %config.agent.name,
        "momentum starting"
    );

    let (status, status_rx) = StatusSink::channel(STATUS_CHANNEL_CAPACITY);
    let handle = Scheduler::new(Arc::new(board), registry, SchedulerConfig::new(scope, &config))
        .with_status(status)
        .spawn_with_feed(feed)?;

    spawn_status_printer(status_rx);
    install_signal_handler(handle.clone())?;
    spawn_console(handle.clone());

    handle.wait();
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn apply_overrides(config: &mut MomentumConfig, cli: &Cli) {
    if let Some(base_url) = &cli.base_url {
        config.board.base_url = base_url.clone();
    }
    if let Some(mode) = cli.execution_mode {
        config.scheduler.execution_mode = mode.into();
    }
    if let Some(lifecycle) = cli.lifecycle {
        config.scheduler.lifecycle = lifecycle.into();
    }
    if let Some(workdir) = &cli.workdir {
        config.agent.work_dir = Some(workdir.clone());
    }
}

fn check_config(config: &MomentumConfig) -> Result<(), MainError> {
    let mut errors = Vec::new();
    for issue in config.validate() {
        match issue.level {
            ValidationLevel::Error => errors.push(format!("  {}: {}", issue.code, issue.message)),
            ValidationLevel::Warning => {
                tracing::warn!(code = issue.code, "{}", issue.message);
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MainError::InvalidConfig(errors.join("\n")))
    }
}

fn spawn_status_printer(events: Receiver<StatusEvent>) {
    thread::spawn(move || {
        for event in events {
            println!("{}", render_status(&event));
        }
    });
}

#[cfg(unix)]
fn install_signal_handler(handle: SchedulerHandle) -> Result<(), MainError> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).map_err(|source| MainError::Signals { source })?;
    thread::spawn(move || {
        for signal in signals.forever() {
            if handle.is_shutting_down() {
                tracing::warn!(signal, "second signal, exiting without waiting for agents");
                std::process::exit(130);
            }
            tracing::info!(signal, "shutdown requested");
            handle.shutdown();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handler(_handle: SchedulerHandle) -> Result<(), MainError> {
    Ok(())
}

/// Read operator commands from stdin until `quit` or end of input.
fn spawn_console(handle: SchedulerHandle) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_command(&line) {
                Ok(command) => {
                    let quit = command == OperatorCommand::Quit;
                    println!("{}", execute(&handle, command));
                    if quit {
                        break;
                    }
                }
                Err(CommandError::Empty) => {}
                Err(err) => eprintln!("{err}"),
            }
        }
    });
}
