//! Tempo error type, shared across all crates.

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TempoError>;

/// All the ways Tempo operations can fail.
#[derive(Debug, thiserror::Error)]
pub enum TempoError {
    #[error("config error: {0}")]
    Config(String),

    /// A task definition failed validation before any write happened.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid cron expression: {0}")]
    Cron(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A task already has an in-flight execution.
    #[error("task {0} is already running")]
    AlreadyRunning(String),

    /// The global concurrency cap is exhausted; the caller must retry.
    #[error("maximum concurrent executions reached ({0} running)")]
    CapacityExhausted(usize),

    #[error("agent error: {0}")]
    Agent(String),
}

impl TempoError {
    /// True for the rejections `execute_now` raises without side effects.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TempoError::AlreadyRunning(_) | TempoError::CapacityExhausted(_)
        )
    }
}
