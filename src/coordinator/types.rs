// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the lifecycle state machine and the status snapshot.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ stop() before start()        │ local store open
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                        stop()│
//!    │                              ↓
//!    └────────────────────── ShuttingDown
//!
//! Starting ──(local store or config error)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`. Nothing opened.
//! - **Starting**: `start()` called, opening stores and probing the remote.
//! - **Running**: Accepting `queue()` calls. Online or offline, both are `Running`.
//! - **ShuttingDown**: `stop()` called. Background tasks are exiting.
//! - **Stopped**: Stores closed. Safe to drop.
//! - **Failed**: The local store could not be opened. Engine cannot continue.

use serde::Serialize;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Engine created but not started.
    Created,

    /// Opening the local store, configuring the remote, first probe.
    Starting,

    /// Logging mutations and replaying when online.
    Running,

    /// Background tasks are being signalled and joined.
    ShuttingDown,

    /// Engine has shut down cleanly.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Status snapshot for dashboards.
///
/// Reads only the online flag and one `GROUP BY` over the local log; no
/// network I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub online: bool,
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_stats_serialize() {
        let stats = EngineStats {
            online: false,
            pending: 3,
            synced: 10,
            failed: 1,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"online": false, "pending": 3, "synced": 10, "failed": 1})
        );
    }
}
