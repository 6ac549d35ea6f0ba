//! # Oplog Replicator
//!
//! Offline-first replication for applications that write to a local SQLite
//! store and need those writes mirrored to a central SQL database.
//!
//! ## Architecture
//!
//! The application keeps writing locally. Every committed mutation is also
//! recorded in an operation log in the same SQLite file, and a background
//! worker replays the log against the remote store whenever it is reachable:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          oplog-replicator                            │
//! │                                                                      │
//! │  queue() ──► ┌──────────────┐      ┌──────────┐      ┌────────────┐  │
//! │              │ OperationLog │─────►│ Replayer │─────►│ RemoteStore│  │
//! │              │ (SQLite)     │      │ (drain)  │      │ (sqlx Any) │  │
//! │              └──────────────┘      └──────────┘      └────────────┘  │
//! │                                         ▲                  ▲         │
//! │                                  ┌──────┴────────┐         │         │
//! │                                  │ HealthMonitor │──probe──┘         │
//! │                                  └───────────────┘                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Statements are written once in the SQLite dialect; [`Dialect`] rewrites
//! them for PostgreSQL or MySQL before they reach the remote.
//!
//! ## Delivery
//!
//! - Entries replay in creation order, one statement each
//! - A failing entry is retried on later passes until the retry ceiling,
//!   then parked as `failed` without blocking the rest of the log
//! - Delivery is at-least-once; inserts use conflict-ignoring SQL
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_replicator::{EngineConfig, OperationKind, Payload, ReplicationEngine};
//! use oplog_replicator::config::RemoteConfig;
//!
//! #[tokio::main]
//! async fn main() -> oplog_replicator::Result<()> {
//!     let mut config = EngineConfig::default();
//!     config.remote = Some(RemoteConfig::new("postgres://pos:secret@hq/pos"));
//!
//!     let mut engine = ReplicationEngine::new(config);
//!     engine.start().await?;
//!
//!     let payload = Payload::new().with("nama", "Bumbu")?;
//!     engine.queue("kategori", OperationKind::Insert, 7, &payload).await?;
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod dialect;
pub mod error;
pub mod health;
pub mod metrics;
pub mod oplog;
pub mod payload;
pub mod remote;
pub mod replay;
pub mod resilience;

// Re-exports for convenience
pub use config::{DrainConfig, EngineConfig, HealthConfig, LocalConfig, RemoteConfig, SyncSettings};
pub use coordinator::{EngineState, EngineStats, ReplicationEngine};
pub use dialect::Dialect;
pub use error::{ReplicationError, Result};
pub use health::{HealthMonitor, OnlineState};
pub use oplog::{EntryStatus, LogEntry, OperationKind, OperationLog, StatusCounts};
pub use payload::{ColumnValue, Payload};
pub use remote::{ExecOutcome, IdCapture, RemoteStore, SqlRemoteStore, Statement};
pub use replay::{DrainStats, Replayer};
