#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyRunning,
    #[error("agent has not been started")]
    NotStarted,
    #[error("runner has already completed a run")]
    RunnerSpent,
    #[error("agent executable not found: {name}")]
    NotFound { name: String },
    #[error("invalid agent request: {message}")]
    InvalidRequest { message: String },
    #[error("agent spawn failed: {message}")]
    Spawn { message: String },
    #[error("agent signal failed: {message}")]
    Signal { message: String },
    #[error("agent runtime error: {message}")]
    Runtime { message: String },
}
