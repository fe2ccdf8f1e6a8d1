//! Error types for cloister-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for cloister-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while driving a worker process.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A run was requested while the sandbox already had a live worker.
    #[error("sandbox is already running")]
    AlreadyRunning,

    /// The worker process could not be started or fed its request.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// No terminal event arrived before the watchdog fired.
    #[error("timeout after {0:?}, sandbox killed")]
    Timeout(Duration),

    /// The worker reported a failure (blocked module, script error, ...).
    #[error("{name}: {message}")]
    Execution {
        /// Error name reported by the worker
        name: String,
        /// Human-readable message reported by the worker
        message: String,
    },

    /// The worker ended its lifecycle without a terminal event.
    #[error("worker exited without a result (exit code {0})")]
    NoResult(i32),

    /// Undecodable bytes on the framed channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid module name given to a stub.
    #[error("invalid module name - {0:?}")]
    InvalidModule(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
