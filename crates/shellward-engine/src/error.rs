//! Error types for validation and execution.

use std::time::Duration;

use thiserror::Error;

use crate::runner::ExecutionResult;

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for validation and execution operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The script could not be parsed, or uses an unsupported shell
    /// construct. Nothing is executed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The policy rejected a command, a working directory, or a
    /// redirect target. Nothing is spawned for the denied invocation.
    #[error("command '{command}' denied: {reason}")]
    Denied {
        /// The offending command (or path, for confinement denials).
        command: String,
        /// Human-readable denial reason.
        reason: String,
    },

    /// The operating system failed to start the process.
    #[error("failed to launch '{command}': {source}")]
    Launch {
        /// Command that failed to start.
        command: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The deadline expired; the in-flight process tree was killed.
    #[error("execution timed out after {limit:?}")]
    Timeout {
        /// The deadline that was exceeded.
        limit: Duration,
        /// Output collected before the deadline, `timed_out` set.
        partial: Box<ExecutionResult>,
    },

    /// The caller cancelled the execution; the process tree was killed.
    #[error("execution cancelled")]
    Cancelled,

    /// The interpreter hit a runtime fault (unsupported expansion,
    /// redirect failure, malformed invocation).
    #[error("execution error: {0}")]
    Execution(String),

    /// An IO failure outside the taxonomy above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
