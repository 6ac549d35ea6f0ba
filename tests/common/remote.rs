// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Switchable remote store for testing.
//!
//! Wraps a real [`SqlRemoteStore`] on a SQLite file so replayed statements
//! actually land somewhere, and adds knobs to take it "down" or make it
//! reject statements. Records every executed statement for assertions.

use oplog_replicator::config::RemoteConfig;
use oplog_replicator::remote::{BoxFuture, ExecOutcome, RemoteStore, Statement};
use oplog_replicator::{Dialect, ReplicationError, SqlRemoteStore};
use sqlx::AnyPool;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub const KATEGORI_SCHEMA: &str =
    "CREATE TABLE kategori (id INTEGER PRIMARY KEY AUTOINCREMENT, nama TEXT NOT NULL)";

pub struct SwitchableRemote {
    inner: SqlRemoteStore,
    up: AtomicBool,
    rejecting: AtomicBool,
    pings: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl SwitchableRemote {
    /// Create a remote backed by `dir/remote.db` with the `kategori` table.
    pub async fn new(dir: &Path) -> Self {
        let url = format!("sqlite://{}?mode=rwc", dir.join("remote.db").display());
        let inner = SqlRemoteStore::connect(&RemoteConfig::new(url))
            .await
            .expect("remote sqlite");
        sqlx::query(KATEGORI_SCHEMA)
            .execute(inner.pool())
            .await
            .expect("create kategori");

        Self {
            inner,
            up: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Reachable, but every statement fails.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn pool(&self) -> &AnyPool {
        self.inner.pool()
    }

    /// All `kategori` rows as (id, nama), by id.
    pub async fn kategori_rows(&self) -> Vec<(i64, String)> {
        sqlx::query_as::<_, (i64, String)>("SELECT id, nama FROM kategori ORDER BY id")
            .fetch_all(self.pool())
            .await
            .expect("select kategori")
    }

    fn check_up(&self, operation: &str) -> Result<(), ReplicationError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReplicationError::remote(operation, "connection refused"))
        }
    }
}

impl RemoteStore for SwitchableRemote {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pings.fetch_add(1, Ordering::SeqCst);
            self.check_up("ping")?;
            self.inner.ping().await
        })
    }

    fn execute<'a>(&'a self, statement: &'a Statement) -> BoxFuture<'a, ExecOutcome> {
        Box::pin(async move {
            self.check_up("execute")?;
            if self.rejecting.load(Ordering::SeqCst) {
                return Err(ReplicationError::remote(
                    "execute",
                    "UNIQUE constraint failed: kategori.nama",
                ));
            }
            self.executed.lock().unwrap().push(statement.sql.clone());
            self.inner.execute(statement).await
        })
    }
}

/// Reachable, but `execute` checks out a pooled connection and never returns.
pub struct HangingRemote {
    inner: SqlRemoteStore,
    entered: AtomicUsize,
}

#[allow(dead_code)]
impl HangingRemote {
    pub async fn new(dir: &Path) -> Self {
        let url = format!("sqlite://{}?mode=rwc", dir.join("hanging.db").display());
        let inner = SqlRemoteStore::connect(&RemoteConfig::new(url))
            .await
            .expect("remote sqlite");
        Self {
            inner,
            entered: AtomicUsize::new(0),
        }
    }

    /// Statements currently or previously stuck in `execute`.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &AnyPool {
        self.inner.pool()
    }
}

impl RemoteStore for HangingRemote {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        self.inner.ping()
    }

    fn execute<'a>(&'a self, _statement: &'a Statement) -> BoxFuture<'a, ExecOutcome> {
        Box::pin(async move {
            let _conn = self
                .inner
                .pool()
                .acquire()
                .await
                .map_err(|e| ReplicationError::remote("execute", e))?;
            self.entered.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<ExecOutcome, ReplicationError>>().await
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }
}
