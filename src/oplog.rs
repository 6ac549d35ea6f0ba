// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The operation log: a durable record of local mutations awaiting replay.
//!
//! Every mutation the application reports through
//! [`ReplicationEngine::queue`](crate::ReplicationEngine::queue) becomes one
//! row in the `operation_log` table of the local SQLite store. Rows are
//! replayed to the remote store in `created_at, id` order and are never
//! deleted by replication itself.
//!
//! # Entry Lifecycle
//!
//! ```text
//!                 replay ok
//!   ┌─────────┐ ───────────▶ ┌────────┐
//!   │ pending │              │ synced │   (terminal)
//!   └─────────┘ ───────────▶ └────────┘
//!     │    ▲    replay error,
//!     │    └─── retry_count < ceiling
//!     │
//!     │ replay error, retry_count reaches ceiling
//!     ▼
//!   ┌────────┐
//!   │ failed │   (terminal, needs an operator)
//!   └────────┘
//! ```
//!
//! Only `status`, `synced_at`, `retry_count` and `last_error` ever change.
//! Every transition is guarded by `WHERE status = 'pending'`, so terminal
//! rows cannot move even if two drains race.
//!
//! # SQLite Busy Handling
//!
//! The application writes to the same SQLite file, so the log can see
//! SQLITE_BUSY/SQLITE_LOCKED. Every statement goes through
//! `execute_with_retry` with exponential backoff.
//!
//! # Identity Mapping
//!
//! A remote store may assign its own id when an insert is replayed. The
//! `remote_identity` table remembers `(entity_kind, local_id) → remote_id` so
//! later updates and deletes hit the right remote row.

use crate::config::LocalConfig;
use crate::error::{ReplicationError, Result};
use crate::payload::{check_identifier, Payload};
use crate::resilience::RetryConfig;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    retry: &RetryConfig,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Local store operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Local store busy, retrying"
                );
                crate::metrics::local_retries_total(operation_name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "Local store busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of mutation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(OperationKind::Insert),
            "UPDATE" => Ok(OperationKind::Update),
            "DELETE" => Ok(OperationKind::Delete),
            other => Err(ReplicationError::InvalidInput(format!("unknown operation: {}", other))),
        }
    }
}

/// Replication status of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Synced,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Synced => "synced",
            EntryStatus::Failed => "failed",
        }
    }

    /// Whether the entry will never be replayed again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "synced" => Ok(EntryStatus::Synced),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(ReplicationError::Internal(format!("unknown entry status in log: {}", other))),
        }
    }
}

/// One row of the operation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    /// Logical table the change targets.
    pub entity_kind: String,
    pub operation: OperationKind,
    /// Identifier of the row in the local store.
    pub entity_id: i64,
    /// Encoded [`Payload`]; decoded at replay time.
    pub payload: String,
    /// Unix millis. Defines replay order, ties broken by `id`.
    pub created_at: i64,
    pub synced_at: Option<i64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: EntryStatus,
}

impl LogEntry {
    /// Decode the stored payload.
    pub fn decode_payload(&self) -> Result<Payload> {
        Payload::decode(&self.payload)
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    entity_kind: String,
    operation: String,
    entity_id: i64,
    payload: String,
    created_at: i64,
    synced_at: Option<i64>,
    retry_count: i64,
    last_error: Option<String>,
    status: String,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = ReplicationError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(LogEntry {
            id: row.id,
            entity_kind: row.entity_kind,
            operation: row.operation.parse()?,
            entity_id: row.entity_id,
            payload: row.payload,
            created_at: row.created_at,
            synced_at: row.synced_at,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            last_error: row.last_error,
            status: row.status.parse()?,
        })
    }
}

/// Number of entries in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

const SELECT_COLUMNS: &str = "SELECT id, entity_kind, operation, entity_id, payload, created_at, \
     synced_at, retry_count, last_error, status FROM operation_log";

// ═══════════════════════════════════════════════════════════════════════════════
// OperationLog
// ═══════════════════════════════════════════════════════════════════════════════

/// Operation log backed by the local SQLite store.
pub struct OperationLog {
    pool: SqlitePool,
    path: String,
    wal: bool,
    retry_ceiling: u32,
    busy_retry: RetryConfig,
}

impl OperationLog {
    /// Open (or create) the local store and ensure the log schema exists.
    pub async fn open(config: &LocalConfig, retry_ceiling: u32) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening operation log");

        let in_memory = path == MEMORY_PATH;
        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new().filename(&path).create_if_missing(true)
        };
        let wal = config.wal_mode && !in_memory;
        let options = if wal {
            options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        } else {
            options
        };

        // An in-memory database exists per connection and dies with it.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;

        let log = Self {
            pool,
            path,
            wal,
            retry_ceiling: retry_ceiling.max(1),
            busy_retry: RetryConfig::local_store(),
        };
        log.ensure_schema().await?;

        let counts = log.counts().await?;
        if counts.pending > 0 {
            info!(pending = counts.pending, "Found pending entries from previous run");
        }
        Ok(log)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS operation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_kind TEXT NOT NULL,
                operation TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                synced_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_operation_log_status ON operation_log (status, created_at, id)",
            r#"
            CREATE TABLE IF NOT EXISTS remote_identity (
                entity_kind TEXT NOT NULL,
                local_id INTEGER NOT NULL,
                remote_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (entity_kind, local_id)
            )
            "#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Record a mutation. Durable when this returns.
    pub async fn append(
        &self,
        entity_kind: &str,
        operation: OperationKind,
        entity_id: i64,
        payload: &Payload,
    ) -> Result<i64> {
        check_identifier("entity kind", entity_kind)?;
        let encoded = payload.encode()?;
        let created_at = now_millis();
        let pool = &self.pool;

        let result = execute_with_retry("append", &self.busy_retry, || async {
            sqlx::query(
                "INSERT INTO operation_log (entity_kind, operation, entity_id, payload, created_at, status) \
                 VALUES (?, ?, ?, ?, ?, 'pending')",
            )
            .bind(entity_kind)
            .bind(operation.as_str())
            .bind(entity_id)
            .bind(&encoded)
            .bind(created_at)
            .execute(pool)
            .await
        })
        .await?;

        let id = result.last_insert_rowid();
        debug!(entry_id = id, entity_kind, operation = %operation, entity_id, "Appended log entry");
        crate::metrics::record_append(entity_kind, operation.as_str());
        Ok(id)
    }

    /// Oldest pending entries first, up to `limit`.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.list_by_status(EntryStatus::Pending, limit).await
    }

    /// Entries with `status`, in replay order.
    pub async fn list_by_status(&self, status: EntryStatus, limit: usize) -> Result<Vec<LogEntry>> {
        let sql = format!("{} WHERE status = ? ORDER BY created_at, id LIMIT ?", SELECT_COLUMNS);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let pool = &self.pool;

        let rows: Vec<LogRow> = execute_with_retry("list", &self.busy_retry, || async {
            sqlx::query_as(&sql)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await
        })
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }

    /// Fetch one entry.
    pub async fn get(&self, id: i64) -> Result<Option<LogEntry>> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row: Option<LogRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(LogEntry::try_from).transpose()
    }

    /// Mark a pending entry synced. Returns `false` if it was not pending.
    pub async fn mark_synced(&self, id: i64) -> Result<bool> {
        let now = now_millis();
        let pool = &self.pool;

        let result = execute_with_retry("mark_synced", &self.busy_retry, || async {
            sqlx::query(
                "UPDATE operation_log SET status = 'synced', synced_at = ? \
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
        })
        .await?;

        let moved = result.rows_affected() == 1;
        if !moved {
            debug!(entry_id = id, "mark_synced ignored, entry not pending");
        }
        Ok(moved)
    }

    /// Record a failed replay and return the entry's resulting status.
    ///
    /// `retry_count` is incremented and the entry flips to
    /// [`EntryStatus::Failed`] once it reaches the retry ceiling. An entry
    /// that is no longer pending is left alone and its current status is
    /// returned.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<EntryStatus> {
        let ceiling = i64::from(self.retry_ceiling);
        let pool = &self.pool;

        let row: Option<(String, i64)> = execute_with_retry("mark_failed", &self.busy_retry, || async {
            sqlx::query_as(
                r#"
                UPDATE operation_log
                SET retry_count = retry_count + 1,
                    last_error = ?,
                    status = CASE WHEN retry_count + 1 >= ? THEN 'failed' ELSE 'pending' END
                WHERE id = ? AND status = 'pending'
                RETURNING status, retry_count
                "#,
            )
            .bind(error)
            .bind(ceiling)
            .bind(id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        match row {
            Some((status, retry_count)) => {
                let status: EntryStatus = status.parse()?;
                debug!(entry_id = id, retry_count, status = %status, "Recorded replay failure");
                Ok(status)
            }
            None => match self.get(id).await? {
                Some(entry) => Ok(entry.status),
                None => Err(ReplicationError::InvalidInput(format!("no log entry with id {}", id))),
            },
        }
    }

    /// Count entries per status.
    pub async fn counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM operation_log GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<EntryStatus>()? {
                EntryStatus::Pending => counts.pending = n,
                EntryStatus::Synced => counts.synced = n,
                EntryStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Delete synced entries whose `synced_at` is older than `older_than`.
    pub async fn purge_synced(&self, older_than: Duration) -> Result<u64> {
        let window = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(window);
        let pool = &self.pool;

        let result = execute_with_retry("purge_synced", &self.busy_retry, || async {
            sqlx::query("DELETE FROM operation_log WHERE status = 'synced' AND synced_at < ?")
                .bind(cutoff)
                .execute(pool)
                .await
        })
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "Purged synced log entries");
        }
        crate::metrics::record_purge(deleted);
        Ok(deleted)
    }

    /// Remember the id the remote store assigned to a replayed insert.
    pub async fn record_remote_identity(&self, entity_kind: &str, local_id: i64, remote_id: i64) -> Result<()> {
        let now = now_millis();
        let pool = &self.pool;

        execute_with_retry("record_remote_identity", &self.busy_retry, || async {
            sqlx::query(
                r#"
                INSERT INTO remote_identity (entity_kind, local_id, remote_id, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(entity_kind, local_id) DO UPDATE SET
                    remote_id = excluded.remote_id,
                    created_at = excluded.created_at
                "#,
            )
            .bind(entity_kind)
            .bind(local_id)
            .bind(remote_id)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Remote id recorded for a local row, if any.
    pub async fn remote_identity(&self, entity_kind: &str, local_id: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT remote_id FROM remote_identity WHERE entity_kind = ? AND local_id = ?")
                .bind(entity_kind)
                .bind(local_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// The underlying pool, for the application's own local queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if self.wal {
            let pool = &self.pool;
            let result = execute_with_retry("checkpoint", &self.busy_retry, || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!(path = %self.path, "Operation log closed");
    }
}
