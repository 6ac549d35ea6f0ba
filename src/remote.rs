// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote store seam.
//!
//! The engine only needs three things from the remote store: a reachability
//! probe, statement execution and its SQL dialect. [`RemoteStore`] captures
//! that so tests (and unusual deployments) can supply their own.
//!
//! [`SqlRemoteStore`] is the production implementation on top of
//! `sqlx::AnyPool`, covering PostgreSQL, MySQL/MariaDB and SQLite.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_replicator::remote::{BoxFuture, ExecOutcome, RemoteStore, Statement};
//! use oplog_replicator::Dialect;
//!
//! struct AlwaysUp;
//!
//! impl RemoteStore for AlwaysUp {
//!     fn dialect(&self) -> Dialect {
//!         Dialect::Postgres
//!     }
//!
//!     fn ping(&self) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn execute<'a>(&'a self, _statement: &'a Statement) -> BoxFuture<'a, ExecOutcome> {
//!         Box::pin(async { Ok(ExecOutcome { rows_affected: 1, returned_id: None }) })
//!     }
//! }
//! ```

use crate::config::RemoteConfig;
use crate::dialect::Dialect;
use crate::error::{ReplicationError, Result};
use crate::payload::ColumnValue;
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How a statement reports the id the remote store assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdCapture {
    /// Nothing to capture.
    None,
    /// The statement ends in `RETURNING <column>`.
    Returning,
    /// Read the driver's last-insert id (MySQL).
    LastInsertId,
}

/// A statement ready to run on the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL already translated to the remote dialect.
    pub sql: String,
    /// Positional parameters, in placeholder order.
    pub params: Vec<ColumnValue>,
    pub id_capture: IdCapture,
}

/// Result of executing a [`Statement`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Id assigned by the remote store, when captured.
    pub returned_id: Option<i64>,
}

/// What the engine needs from a remote store.
pub trait RemoteStore: Send + Sync + 'static {
    /// Dialect statements must be translated to.
    fn dialect(&self) -> Dialect;

    /// Cheap reachability check. Callers bound it with a timeout.
    fn ping(&self) -> BoxFuture<'_, ()>;

    /// Run one statement.
    fn execute<'a>(&'a self, statement: &'a Statement) -> BoxFuture<'a, ExecOutcome>;

    /// Release connections. Default does nothing.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// [`RemoteStore`] over a `sqlx::AnyPool`.
pub struct SqlRemoteStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlRemoteStore {
    /// Build the pool without connecting.
    ///
    /// Connections are made on first use, so an unreachable server at startup
    /// only means the first probe fails.
    pub fn connect_lazy(config: &RemoteConfig) -> Result<Self> {
        install_drivers();
        let dialect = Dialect::from_url(&config.url)?;

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.probe_timeout_duration())
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(&config.url)
            .map_err(|e| ReplicationError::remote("connect", e))?;

        info!(dialect = %dialect, "Remote store configured");
        Ok(Self { pool, dialect })
    }

    /// Build the pool and verify the server answers.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        let store = Self::connect_lazy(config)?;
        store.ping_inner().await?;
        Ok(store)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn ping_inner(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ReplicationError::remote("ping", e))?;
        Ok(())
    }

    async fn execute_inner(&self, statement: &Statement) -> Result<ExecOutcome> {
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.params {
            query = bind_value(query, value);
        }

        match statement.id_capture {
            IdCapture::Returning => {
                let row = query
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| ReplicationError::remote("execute", e))?;
                let returned_id = match row {
                    Some(row) => Some(
                        row.try_get::<i64, _>(0)
                            .or_else(|_| row.try_get::<i32, _>(0).map(i64::from))
                            .map_err(|e| ReplicationError::remote("decode_returning", e))?,
                    ),
                    // Conflict: the row was already there.
                    None => None,
                };
                Ok(ExecOutcome {
                    rows_affected: u64::from(returned_id.is_some()),
                    returned_id,
                })
            }
            IdCapture::LastInsertId | IdCapture::None => {
                let result = query
                    .execute(&self.pool)
                    .await
                    .map_err(|e| ReplicationError::remote("execute", e))?;
                let returned_id = if statement.id_capture == IdCapture::LastInsertId && result.rows_affected() > 0 {
                    result.last_insert_id().filter(|id| *id > 0)
                } else {
                    None
                };
                Ok(ExecOutcome {
                    rows_affected: result.rows_affected(),
                    returned_id,
                })
            }
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &ColumnValue,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        // Text-typed NULL. Replayed statements write nulls inline instead.
        ColumnValue::Null => query.bind(Option::<String>::None),
        ColumnValue::Integer(i) => query.bind(*i),
        ColumnValue::Real(f) => query.bind(*f),
        ColumnValue::Text(s) => query.bind(s.clone()),
        ColumnValue::Bool(b) => query.bind(*b),
        ColumnValue::Blob(bytes) => query.bind(bytes.clone()),
    }
}

impl RemoteStore for SqlRemoteStore {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.ping_inner())
    }

    fn execute<'a>(&'a self, statement: &'a Statement) -> BoxFuture<'a, ExecOutcome> {
        Box::pin(self.execute_inner(statement))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            debug!("Remote pool closed");
            Ok(())
        })
    }
}
