//! Error types for the multiprocessing launcher

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for launching and coordinating worker processes
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("The start method '{method}' is not available on this platform. Available methods are: {available}")]
    UnsupportedStartMethod { method: String, available: String },

    // Global state errors
    #[error("Global flag '{flag}' is locked and cannot be changed in this process")]
    GlobalStateLocked { flag: String },

    // Worker errors
    #[error("Worker process {process_idx} failed: {message}")]
    WorkerFailed { process_idx: usize, message: String },

    #[error("Worker process {process_idx} exited without reporting ({status})")]
    WorkerCrashed { process_idx: usize, status: String },

    #[error("Worker function not registered: {name}")]
    UnknownWorkerFunction { name: String },

    // Checkpoint errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is retryable by a higher-level orchestrator
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WorkerCrashed { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::UnsupportedStartMethod { .. }
                | Error::GlobalStateLocked { .. }
                | Error::UnknownWorkerFunction { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
