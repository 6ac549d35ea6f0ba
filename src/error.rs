// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are grouped by where they come from and what the engine does about
//! them:
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `LocalStore` | No | Operation log read/write failed (surfaced to caller) |
//! | `Offline` | Yes | Remote unreachable; only `force_sync()` reports it |
//! | `Remote` | Yes | Remote driver or connection error |
//! | `Replay` | Yes | One entry failed to replay; recorded on the entry |
//! | `Serialization` | No | Payload could not be encoded/decoded |
//! | `InvalidInput` | No | Bad identifier or empty change, rejected up front |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! "Retryable" here means a later drain cycle may succeed without operator
//! action. Replay and serialization faults are both charged against the
//! entry's retry ceiling; the distinction only matters for diagnostics.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur in the replication engine.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The local operation log failed.
    ///
    /// Fatal to the write path that triggered it: the caller's local write
    /// is already committed but not logged, so it will not replicate.
    #[error("Local store error: {0}")]
    LocalStore(#[from] sqlx::Error),

    /// The remote store is not reachable right now.
    #[error("Remote store is offline")]
    Offline,

    /// Remote store driver or connection error.
    #[error("Remote error ({operation}): {message}")]
    Remote { operation: String, message: String },

    /// Replaying a specific log entry failed.
    #[error("Replay of entry {entry_id} failed: {message}")]
    Replay { entry_id: i64, message: String },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller supplied something the engine can never replay.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a remote error for an operation.
    pub fn remote(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a replay error for a log entry.
    pub fn replay(entry_id: i64, message: impl ToString) -> Self {
        Self::Replay {
            entry_id,
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Offline => true,
            Self::Remote { .. } => true,
            Self::Replay { .. } => true,
            Self::LocalStore(_) => false, // Local DB issues need attention
            Self::Serialization(_) => false,
            Self::InvalidInput(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocalStore(_) => "local_store",
            Self::Offline => "offline",
            Self::Remote { .. } => "remote",
            Self::Replay { .. } => "replay",
            Self::Serialization(_) => "serialization",
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
