//! IPC protocol between the master and its workers.
//!
//! Messages are JSON-serialized and newline-delimited. The master writes to
//! the worker's stdin and reads the worker's stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment variable carrying the supervisor-assigned worker id.
pub const WORKER_ID_ENV: &str = "SHOAL_WORKER_ID";

/// Message from master to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MasterMessage {
    /// Stop taking new work; the channel will be closed after the linger delay.
    Shutdown,
    /// Application-defined payload.
    Message {
        /// Arbitrary JSON
        payload: Value,
    },
}

/// Message from worker to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// Worker can take traffic.
    Ready,
    /// Worker is leaving on its own; its exit is not a crash.
    Disconnect,
    /// Application-defined payload.
    Message {
        /// Arbitrary JSON
        payload: Value,
    },
}

impl MasterMessage {
    /// Create a payload message.
    pub fn message(payload: impl Into<Value>) -> Self {
        Self::Message {
            payload: payload.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerMessage {
    /// Create a payload message.
    pub fn message(payload: impl Into<Value>) -> Self {
        Self::Message {
            payload: payload.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    ///
    /// Lines that are not protocol messages are handed to the application
    /// as a string payload, so stray output is never lost.
    pub fn from_line_lossy(line: &str) -> Self {
        serde_json::from_str(line.trim())
            .unwrap_or_else(|_| Self::message(Value::String(line.trim_end().to_string())))
    }
}
