use thiserror::Error;

/// Top-level error type for GradeGrid.
#[derive(Error, Debug)]
pub enum GradeGridError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No agent available for environment {0}")]
    NoAgentAvailable(String),

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, GradeGridError>;
