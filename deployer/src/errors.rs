//! Error types for the deployer

use thiserror::Error;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Missing or unsupported deployment configuration
    #[error("{0}")]
    ConfigError(String),

    /// A spawned process exited unsuccessfully
    #[error("Process failed: {command} {reason}")]
    ProcessError { command: String, reason: String },

    #[error("Stage '{stage}' timed out after {secs}s")]
    Timeout { stage: String, secs: u64 },

    #[error("Deployment {0} was cancelled")]
    Cancelled(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployerError {
    /// Build a process error from a non-zero exit code
    pub fn exit_code(command: impl Into<String>, code: i32) -> Self {
        DeployerError::ProcessError {
            command: command.into(),
            reason: format!("exited with code {}", code),
        }
    }
}
