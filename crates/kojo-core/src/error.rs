//! Error types for Kojo

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Kojo
#[derive(Error, Debug)]
pub enum KojoError {
    #[error("Unsupported tool: {0}")]
    UnsupportedTool(String),

    #[error("Tool not found on PATH: {0}")]
    ToolNotFound(String),

    #[error("Working directory {0} does not exist or is not a directory")]
    InvalidWorkDir(PathBuf),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is still running")]
    StillRunning(String),

    #[error("Session {0} is not running")]
    NotRunning(String),

    #[error("Session {0} is already restarting")]
    RestartInProgress(String),

    #[error("Unknown mux action: {0}")]
    UnknownAction(String),

    #[error("Mux command failed: {0}")]
    Mux(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Session stream closed")]
    StreamClosed,

    #[error("Manager is shutting down")]
    ShuttingDown,

    #[error("Could not determine {0} directory")]
    MissingDirectory(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KojoError>;
