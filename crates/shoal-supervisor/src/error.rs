//! Error types for the supervisor.

use thiserror::Error;

use crate::worker::WorkerId;

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration rejected at supervisor construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The process forker could not start a worker
    #[error("Failed to spawn worker {worker_id}: {reason}")]
    Spawn {
        /// Id the worker would have had
        worker_id: WorkerId,
        /// Why the spawn failed
        reason: String,
    },

    /// IO error (pipes, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed protocol line
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signal delivery failed
    #[error("Signal error: {0}")]
    Signal(#[from] nix::Error),

    /// A rolling restart is already in flight
    #[error("Already restarting. Cannot restart yet.")]
    AlreadyRestarting,

    /// The first replacement died before it was confirmed healthy
    #[error("Restart aborted: replacement worker {worker_id} died before it was confirmed")]
    RestartAborted {
        /// The replacement that died
        worker_id: WorkerId,
    },

    /// The pool is shutting down and no longer takes a new target
    #[error("Shutting down. Cannot resize.")]
    Quitting,

    /// The control task has stopped
    #[error("Supervisor is no longer running")]
    Stopped,
}

impl SupervisorError {
    /// Create a new configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new spawn error.
    pub fn spawn(worker_id: WorkerId, reason: impl Into<String>) -> Self {
        Self::Spawn {
            worker_id,
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;
