// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replaying log entries to the remote store.
//!
//! A drain pass reads up to `batch_size` pending entries (oldest first) and
//! replays each one independently. One bad entry never stops the batch.
//!
//! # Statements
//!
//! Templates are built in the reference dialect and translated for the
//! remote store:
//!
//! | Operation | Template |
//! |-----------|----------|
//! | Insert | `INSERT INTO kind (c1, …) VALUES (?, …) ON CONFLICT DO NOTHING RETURNING id` |
//! | Update | `UPDATE kind SET c1 = ?, … WHERE id = ?` |
//! | Delete | `DELETE FROM kind WHERE id = ?` |
//!
//! Null values are written as a `NULL` literal rather than bound.
//!
//! The identity column is never sent on insert; the remote store assigns its
//! own and the mapping is recorded. Updates and deletes target the mapped
//! remote id, or the local id when no mapping exists.
//!
//! # Outcomes
//!
//! | Result | Log transition |
//! |--------|----------------|
//! | executed | `mark_synced` |
//! | remote error or timeout, bad payload, empty change | `mark_failed` (retry or terminal) |
//! | local store error | drain aborts, entry untouched |

use crate::dialect::Dialect;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::oplog::{EntryStatus, LogEntry, OperationKind, OperationLog};
use crate::payload::{check_identifier, ColumnValue, Payload};
use crate::remote::{IdCapture, RemoteStore, Statement};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    /// Entries read from the log.
    pub attempted: usize,
    pub synced: usize,
    /// Failed this pass but still pending.
    pub retried: usize,
    /// Reached the retry ceiling this pass.
    pub failed: usize,
}

/// Nulls are written inline so the remote infers the column's own type;
/// an untyped bound null arrives as text on PostgreSQL.
fn value_mark(value: &ColumnValue) -> &'static str {
    match value {
        ColumnValue::Null => "NULL",
        _ => "?",
    }
}

fn bound_params<'a>(values: impl Iterator<Item = &'a ColumnValue>) -> Vec<ColumnValue> {
    values.filter(|v| !matches!(v, ColumnValue::Null)).cloned().collect()
}

/// Build the remote statement for one entry.
///
/// `remote_id` is the mapped remote identity for updates and deletes.
pub fn build_statement(
    dialect: Dialect,
    identity_column: &str,
    entry: &LogEntry,
    payload: &Payload,
    remote_id: Option<i64>,
) -> Result<Statement> {
    check_identifier("entity kind", &entry.entity_kind).map_err(|e| ReplicationError::replay(entry.id, e))?;
    let table = entry.entity_kind.as_str();
    let target = ColumnValue::Integer(remote_id.unwrap_or(entry.entity_id));

    let (template, params, id_capture) = match entry.operation {
        OperationKind::Insert => {
            let values = payload.without(identity_column);
            if values.is_empty() {
                return Err(ReplicationError::replay(entry.id, "insert has no columns to write"));
            }
            let columns: Vec<&str> = values.iter().map(|(c, _)| c).collect();
            let marks: Vec<&str> = values.iter().map(|(_, v)| value_mark(v)).collect();
            let (returning, capture) = if dialect.supports_returning() {
                (Some(identity_column), IdCapture::Returning)
            } else {
                (None, IdCapture::LastInsertId)
            };
            let sql = dialect.insert_ignore(table, &columns, &marks, returning);
            let params = bound_params(values.iter().map(|(_, v)| v));
            (sql, params, capture)
        }
        OperationKind::Update => {
            let values = payload.without(identity_column);
            if values.is_empty() {
                return Err(ReplicationError::replay(entry.id, "update has no columns to set"));
            }
            let assignments: Vec<String> = values
                .iter()
                .map(|(c, v)| format!("{} = {}", c, value_mark(v)))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                table,
                assignments.join(", "),
                identity_column
            );
            let mut params = bound_params(values.iter().map(|(_, v)| v));
            params.push(target);
            (sql, params, IdCapture::None)
        }
        OperationKind::Delete => {
            let sql = format!("DELETE FROM {} WHERE {} = ?", table, identity_column);
            (sql, vec![target], IdCapture::None)
        }
    };

    Ok(Statement {
        sql: dialect.translate(&template),
        params,
        id_capture,
    })
}

const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Replays pending log entries to the remote store.
pub struct Replayer {
    log: Arc<OperationLog>,
    remote: Arc<dyn RemoteStore>,
    identity_column: String,
    execute_timeout: Duration,
    /// Serializes drains from the periodic task, `queue` triggers and `force_sync`.
    drain_lock: Mutex<()>,
}

impl Replayer {
    pub fn new(log: Arc<OperationLog>, remote: Arc<dyn RemoteStore>, identity_column: impl Into<String>) -> Self {
        Self {
            log,
            remote,
            identity_column: identity_column.into(),
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
            drain_lock: Mutex::new(()),
        }
    }

    /// Bound each remote statement. Expiry is recorded against the entry.
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    /// Replay up to `batch_size` pending entries. Callers check online first.
    pub async fn drain_once(&self, batch_size: usize) -> Result<DrainStats> {
        let _guard = self.drain_lock.lock().await;
        let start = Instant::now();

        let entries = self.log.list_pending(batch_size).await?;
        let mut stats = DrainStats {
            attempted: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(stats);
        }

        for entry in &entries {
            match self.replay_entry(entry).await {
                Ok(()) => {
                    if self.log.mark_synced(entry.id).await? {
                        stats.synced += 1;
                    }
                }
                Err(e @ ReplicationError::LocalStore(_)) => {
                    warn!(entry_id = entry.id, error = %e, "Local store failed during drain, aborting pass");
                    metrics::record_error(e.kind());
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_error(e.kind());
                    let message = e.to_string();
                    match self.log.mark_failed(entry.id, &message).await? {
                        EntryStatus::Failed => {
                            stats.failed += 1;
                            metrics::record_entry_failed(&entry.entity_kind);
                            warn!(
                                entry_id = entry.id,
                                entity_kind = %entry.entity_kind,
                                error = %message,
                                "Entry reached retry ceiling, giving up"
                            );
                        }
                        _ => {
                            stats.retried += 1;
                            debug!(entry_id = entry.id, error = %message, "Replay failed, will retry");
                        }
                    }
                }
            }
        }

        metrics::record_drain_cycle(stats.attempted, stats.synced, stats.retried + stats.failed, start.elapsed());
        info!(
            attempted = stats.attempted,
            synced = stats.synced,
            retried = stats.retried,
            failed = stats.failed,
            "Drain pass complete"
        );
        Ok(stats)
    }

    async fn replay_entry(&self, entry: &LogEntry) -> Result<()> {
        let payload = entry.decode_payload()?;

        let remote_id = match entry.operation {
            OperationKind::Insert => None,
            OperationKind::Update | OperationKind::Delete => {
                let mapped = self.log.remote_identity(&entry.entity_kind, entry.entity_id).await?;
                if mapped.is_none() {
                    debug!(
                        entry_id = entry.id,
                        entity_kind = %entry.entity_kind,
                        entity_id = entry.entity_id,
                        "No remote identity recorded, using local id"
                    );
                }
                mapped
            }
        };

        let statement = build_statement(
            self.remote.dialect(),
            &self.identity_column,
            entry,
            &payload,
            remote_id,
        )?;

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.execute_timeout, self.remote.execute(&statement))
            .await
            .map_err(|_| {
                ReplicationError::replay(
                    entry.id,
                    format!("remote execute timed out after {:?}", self.execute_timeout),
                )
            })?
            .map_err(|e| ReplicationError::replay(entry.id, e))?;
        metrics::record_replay_latency(entry.operation.as_str(), start.elapsed());

        if entry.operation == OperationKind::Insert {
            if let Some(remote_id) = outcome.returned_id {
                self.log
                    .record_remote_identity(&entry.entity_kind, entry.entity_id, remote_id)
                    .await?;
            }
        }
        debug!(
            entry_id = entry.id,
            operation = %entry.operation,
            rows_affected = outcome.rows_affected,
            "Replayed entry"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalConfig, RemoteConfig};
    use crate::remote::SqlRemoteStore;
    use tempfile::{tempdir, TempDir};

    fn entry(op: OperationKind, entity_id: i64) -> LogEntry {
        LogEntry {
            id: 1,
            entity_kind: "kategori".to_string(),
            operation: op,
            entity_id,
            payload: String::new(),
            created_at: 0,
            synced_at: None,
            retry_count: 0,
            last_error: None,
            status: EntryStatus::Pending,
        }
    }

    fn payload() -> Payload {
        Payload::new().with("id", 7i64).unwrap().with("nama", "Bumbu").unwrap()
    }

    #[test]
    fn test_build_insert_postgres() {
        let stmt = build_statement(Dialect::Postgres, "id", &entry(OperationKind::Insert, 7), &payload(), None).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO kategori (nama) VALUES ($1) ON CONFLICT DO NOTHING RETURNING id"
        );
        assert_eq!(stmt.params, vec![ColumnValue::Text("Bumbu".into())]);
        assert_eq!(stmt.id_capture, IdCapture::Returning);
    }

    #[test]
    fn test_build_insert_mysql() {
        let stmt = build_statement(Dialect::MySql, "id", &entry(OperationKind::Insert, 7), &payload(), None).unwrap();
        assert_eq!(stmt.sql, "INSERT IGNORE INTO kategori (nama) VALUES (?)");
        assert_eq!(stmt.id_capture, IdCapture::LastInsertId);
    }

    #[test]
    fn test_build_update_uses_remote_id() {
        let p = Payload::new().with("nama", "Rempah").unwrap().with("aktif", false).unwrap();
        let stmt = build_statement(Dialect::Postgres, "id", &entry(OperationKind::Update, 7), &p, Some(1042)).unwrap();
        assert_eq!(stmt.sql, "UPDATE kategori SET nama = $1, aktif = $2 WHERE id = $3");
        assert_eq!(
            stmt.params,
            vec![
                ColumnValue::Text("Rempah".into()),
                ColumnValue::Bool(false),
                ColumnValue::Integer(1042)
            ]
        );
    }

    #[test]
    fn test_build_writes_nulls_inline() {
        let p = Payload::new()
            .with("nama", "Bumbu").unwrap()
            .with("parent_id", ColumnValue::Null).unwrap()
            .with("urutan", 3i64).unwrap();

        let stmt = build_statement(Dialect::Postgres, "id", &entry(OperationKind::Insert, 7), &p, None).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO kategori (nama, parent_id, urutan) VALUES ($1, NULL, $2) ON CONFLICT DO NOTHING RETURNING id"
        );
        assert_eq!(stmt.params, vec![ColumnValue::Text("Bumbu".into()), ColumnValue::Integer(3)]);

        let stmt = build_statement(Dialect::Postgres, "id", &entry(OperationKind::Update, 7), &p, Some(9)).unwrap();
        assert_eq!(stmt.sql, "UPDATE kategori SET nama = $1, parent_id = NULL, urutan = $2 WHERE id = $3");
        assert_eq!(stmt.params.len(), 3);
        assert_eq!(stmt.params[2], ColumnValue::Integer(9));
    }

    #[test]
    fn test_build_delete_falls_back_to_local_id() {
        let stmt = build_statement(Dialect::Sqlite, "id", &entry(OperationKind::Delete, 7), &Payload::new(), None).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM kategori WHERE id = ?");
        assert_eq!(stmt.params, vec![ColumnValue::Integer(7)]);
    }

    #[test]
    fn test_build_empty_changes_are_replay_faults() {
        let only_id = Payload::new().with("id", 7i64).unwrap();
        let err = build_statement(Dialect::Sqlite, "id", &entry(OperationKind::Insert, 7), &only_id, None).unwrap_err();
        assert!(matches!(err, ReplicationError::Replay { entry_id: 1, .. }));

        let err = build_statement(Dialect::Sqlite, "id", &entry(OperationKind::Update, 7), &Payload::new(), None).unwrap_err();
        assert!(matches!(err, ReplicationError::Replay { .. }));
    }

    #[test]
    fn test_build_rejects_tampered_entity_kind() {
        let mut e = entry(OperationKind::Delete, 7);
        e.entity_kind = "kategori; DROP TABLE users".to_string();
        let err = build_statement(Dialect::Sqlite, "id", &e, &Payload::new(), None).unwrap_err();
        assert!(matches!(err, ReplicationError::Replay { .. }));
    }

    async fn setup(ceiling: u32) -> (TempDir, Arc<OperationLog>, Arc<SqlRemoteStore>) {
        let dir = tempdir().unwrap();
        let log = OperationLog::open(
            &LocalConfig {
                sqlite_path: dir.path().join("local.db").to_string_lossy().to_string(),
                wal_mode: true,
            },
            ceiling,
        )
        .await
        .unwrap();
        let remote = SqlRemoteStore::connect(&RemoteConfig::new(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("remote.db").display()
        )))
        .await
        .unwrap();
        sqlx::query("CREATE TABLE kategori (id INTEGER PRIMARY KEY AUTOINCREMENT, nama TEXT NOT NULL)")
            .execute(remote.pool())
            .await
            .unwrap();
        (dir, Arc::new(log), Arc::new(remote))
    }

    #[tokio::test]
    async fn test_drain_insert_update_delete_with_identity_mapping() {
        let (_dir, log, remote) = setup(5).await;
        // Occupy remote id 1 so the remote assigns a different id than local.
        sqlx::query("INSERT INTO kategori (nama) VALUES ('Lain')")
            .execute(remote.pool())
            .await
            .unwrap();

        let replayer = Replayer::new(Arc::clone(&log), remote.clone() as Arc<dyn RemoteStore>, "id");
        log.append("kategori", OperationKind::Insert, 1, &Payload::new().with("id", 1i64).unwrap().with("nama", "Bumbu").unwrap())
            .await
            .unwrap();
        log.append("kategori", OperationKind::Update, 1, &Payload::new().with("nama", "Rempah").unwrap())
            .await
            .unwrap();

        let stats = replayer.drain_once(100).await.unwrap();
        assert_eq!(stats, DrainStats { attempted: 2, synced: 2, retried: 0, failed: 0 });
        assert_eq!(log.remote_identity("kategori", 1).await.unwrap(), Some(2));

        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, nama FROM kategori ORDER BY id")
            .fetch_all(remote.pool())
            .await
            .unwrap();
        assert_eq!(rows, vec![(1, "Lain".to_string()), (2, "Rempah".to_string())]);

        log.append("kategori", OperationKind::Delete, 1, &Payload::new()).await.unwrap();
        replayer.drain_once(100).await.unwrap();
        let remaining: Vec<(i64,)> = sqlx::query_as("SELECT id FROM kategori").fetch_all(remote.pool()).await.unwrap();
        assert_eq!(remaining, vec![(1,)]);
    }

    #[tokio::test]
    async fn test_drain_bad_entry_does_not_block_batch() {
        let (_dir, log, remote) = setup(2).await;
        let replayer = Replayer::new(Arc::clone(&log), remote.clone() as Arc<dyn RemoteStore>, "id");

        let bad = log
            .append("tidak_ada", OperationKind::Insert, 1, &Payload::new().with("nama", "x").unwrap())
            .await
            .unwrap();
        let good = log
            .append("kategori", OperationKind::Insert, 2, &Payload::new().with("nama", "Bumbu").unwrap())
            .await
            .unwrap();

        let stats = replayer.drain_once(100).await.unwrap();
        assert_eq!(stats, DrainStats { attempted: 2, synced: 1, retried: 1, failed: 0 });
        assert_eq!(log.get(good).await.unwrap().unwrap().status, EntryStatus::Synced);

        let bad_entry = log.get(bad).await.unwrap().unwrap();
        assert_eq!(bad_entry.status, EntryStatus::Pending);
        assert_eq!(bad_entry.retry_count, 1);
        assert!(bad_entry.last_error.unwrap().contains("tidak_ada"));

        let stats = replayer.drain_once(100).await.unwrap();
        assert_eq!(stats, DrainStats { attempted: 1, synced: 0, retried: 0, failed: 1 });
        assert_eq!(log.get(bad).await.unwrap().unwrap().status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_drain_undecodable_payload_consumes_retry() {
        let (_dir, log, remote) = setup(5).await;
        let replayer = Replayer::new(Arc::clone(&log), remote as Arc<dyn RemoteStore>, "id");

        let id = log
            .append("kategori", OperationKind::Insert, 1, &Payload::new().with("nama", "x").unwrap())
            .await
            .unwrap();
        sqlx::query("UPDATE operation_log SET payload = '{broken' WHERE id = ?")
            .bind(id)
            .execute(log.pool())
            .await
            .unwrap();

        let stats = replayer.drain_once(100).await.unwrap();
        assert_eq!(stats.retried, 1);
        let entry = log.get(id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_error.unwrap().starts_with("Serialization error"));
    }

    struct StalledRemote;

    impl RemoteStore for StalledRemote {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn ping(&self) -> crate::remote::BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn execute<'a>(&'a self, _statement: &'a Statement) -> crate::remote::BoxFuture<'a, crate::remote::ExecOutcome> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn test_drain_stalled_execute_consumes_retry() {
        let (_dir, log, _remote) = setup(5).await;
        let replayer = Replayer::new(Arc::clone(&log), Arc::new(StalledRemote) as Arc<dyn RemoteStore>, "id")
            .with_execute_timeout(Duration::from_millis(50));

        let id = log
            .append("kategori", OperationKind::Insert, 1, &Payload::new().with("nama", "x").unwrap())
            .await
            .unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), replayer.drain_once(100))
            .await
            .expect("drain pass bounded by execute timeout")
            .unwrap();
        assert_eq!(stats, DrainStats { attempted: 1, synced: 0, retried: 1, failed: 0 });

        let entry = log.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_drain_empty_log() {
        let (_dir, log, remote) = setup(5).await;
        let replayer = Replayer::new(log, remote as Arc<dyn RemoteStore>, "id");
        assert_eq!(replayer.drain_once(100).await.unwrap(), DrainStats::default());
    }
}
