// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The facade the application talks to. It ties together:
//! - the operation log via [`crate::oplog::OperationLog`]
//! - remote reachability via [`crate::health::HealthMonitor`]
//! - replay via [`crate::replay::Replayer`]
//!
//! # Architecture
//!
//! ```text
//!   app write ──► local store
//!        │
//!        └─► queue() ──► operation_log (durable) ──► notify ─┐
//!                                                            ▼
//!   health task ──probe──► OnlineState ◄──read── drain task ──► remote store
//! ```
//!
//! Two background tasks run next to the foreground path:
//! 1. The health task probes the remote every `health.interval_sec`
//! 2. The drain task replays pending entries every `drain.interval_sec`,
//!    or as soon as `queue()` or a reconnect wakes it
//!
//! `queue()` never waits on the network. The log table, not an in-memory
//! queue, is the hand-off point, so a crash loses nothing that `queue()`
//! acknowledged.

mod drain_task;
mod health_task;
mod types;

pub use types::{EngineState, EngineStats};

use crate::config::EngineConfig;
use crate::error::{ReplicationError, Result};
use crate::health::{HealthMonitor, OnlineState};
use crate::metrics;
use crate::oplog::{EntryStatus, LogEntry, OperationKind, OperationLog};
use crate::payload::Payload;
use crate::remote::{RemoteStore, SqlRemoteStore};
use crate::replay::{DrainStats, Replayer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The offline-first replication engine.
///
/// Owned by the application's composition root; wrap it in an `Arc` to share
/// it once started.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> oplog_replicator::Result<()> {
/// use oplog_replicator::{EngineConfig, OperationKind, Payload, ReplicationEngine};
/// use oplog_replicator::config::RemoteConfig;
///
/// let mut config = EngineConfig::for_testing("/var/lib/pos/local.db");
/// config.remote = Some(RemoteConfig::new("postgres://pos:secret@hq/pos"));
///
/// let mut engine = ReplicationEngine::new(config);
/// engine.start().await?;
///
/// let payload = Payload::new().with("nama", "Bumbu")?;
/// engine.queue("kategori", OperationKind::Insert, 7, &payload).await?;
///
/// println!("{:?}", engine.stats().await?);
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ReplicationEngine {
    config: EngineConfig,

    /// Remote supplied by the caller instead of one built from `config.remote`.
    remote_override: Option<Arc<dyn RemoteStore>>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Written only by the health monitor.
    online: Arc<OnlineState>,

    log: Option<Arc<OperationLog>>,
    remote: Option<Arc<dyn RemoteStore>>,
    monitor: Option<Arc<HealthMonitor>>,
    replayer: Option<Arc<Replayer>>,

    /// Wakes the drain task.
    trigger: Arc<Notify>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    handles: Vec<JoinHandle<()>>,
}

impl ReplicationEngine {
    /// Create an engine. Nothing is opened until [`start()`](Self::start).
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an engine that replays to `remote` instead of `config.remote`.
    pub fn with_remote(config: EngineConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self::build(config, Some(remote))
    }

    fn build(config: EngineConfig, remote_override: Option<Arc<dyn RemoteStore>>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            remote_override,
            state_tx,
            state_rx,
            online: Arc::new(OnlineState::new()),
            log: None,
            remote: None,
            monitor: None,
            replayer: None,
            trigger: Arc::new(Notify::new()),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Whether the last probe reached the remote store.
    pub fn is_online(&self) -> bool {
        self.online.is_online()
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Opens the operation log (failure is fatal)
    /// 2. Configures the remote store (failure means offline-only mode)
    /// 3. Probes the remote once
    /// 4. Spawns the health and drain tasks when sync is enabled
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid engine configuration");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        info!(
            sync_enabled = self.config.sync_enabled,
            remote_configured = self.config.remote.is_some() || self.remote_override.is_some(),
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        let log = match OperationLog::open(&self.config.local, self.config.settings.retry_ceiling).await {
            Ok(log) => Arc::new(log),
            Err(e) => {
                error!(error = %e, path = %self.config.local.sqlite_path, "Failed to open local store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        self.log = Some(Arc::clone(&log));

        let remote = if self.config.sync_enabled {
            self.open_remote()
        } else {
            info!("Sync disabled, operations are logged but not replayed");
            None
        };

        let probe_timeout = self
            .config
            .remote
            .as_ref()
            .map(|r| r.probe_timeout_duration())
            .unwrap_or(DEFAULT_PROBE_TIMEOUT);
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&self.online),
            remote.clone(),
            probe_timeout,
        ));
        let online = monitor.probe_once().await;
        self.monitor = Some(Arc::clone(&monitor));

        if let Some(ref remote) = remote {
            let replayer = Arc::new(
                Replayer::new(
                    Arc::clone(&log),
                    Arc::clone(remote),
                    self.config.settings.identity_column.clone(),
                )
                .with_execute_timeout(self.config.settings.replay_timeout()),
            );
            self.replayer = Some(Arc::clone(&replayer));
            self.spawn_health_task(monitor);
            self.spawn_drain_task(replayer);
        }
        self.remote = remote;

        self.set_state(EngineState::Running);
        info!(online, tasks = self.handles.len(), "Replication engine running");
        Ok(())
    }

    fn open_remote(&self) -> Option<Arc<dyn RemoteStore>> {
        if let Some(ref remote) = self.remote_override {
            return Some(Arc::clone(remote));
        }
        let Some(ref config) = self.config.remote else {
            info!("No remote store configured, running offline-only");
            return None;
        };
        match SqlRemoteStore::connect_lazy(config) {
            Ok(store) => Some(Arc::new(store) as Arc<dyn RemoteStore>),
            Err(e) => {
                warn!(error = %e, "Remote store unusable, running offline-only");
                metrics::record_error(e.kind());
                None
            }
        }
    }

    fn spawn_health_task(&mut self, monitor: Arc<HealthMonitor>) {
        let interval = self.config.settings.health.interval();
        let trigger = Arc::clone(&self.trigger);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            health_task::run_health(monitor, interval, trigger, shutdown_rx).await;
        });

        debug!("Spawned health monitor task");
        self.handles.push(handle);
    }

    fn spawn_drain_task(&mut self, replayer: Arc<Replayer>) {
        let online = Arc::clone(&self.online);
        let trigger = Arc::clone(&self.trigger);
        let config = self.config.settings.drain.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            drain_task::run_drain(replayer, online, trigger, config, shutdown_rx).await;
        });

        debug!("Spawned drain task");
        self.handles.push(handle);
    }

    fn running_log(&self) -> Result<&Arc<OperationLog>> {
        match (self.state(), self.log.as_ref()) {
            (EngineState::Running, Some(log)) => Ok(log),
            (EngineState::ShuttingDown | EngineState::Stopped, _) => Err(ReplicationError::Shutdown),
            (state, _) => Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: state.to_string(),
            }),
        }
    }

    /// Record a local mutation for replay.
    ///
    /// Call after the local write commits. The entry is durable when this
    /// returns; replay happens in the background. Never waits on the remote.
    pub async fn queue(
        &self,
        entity_kind: &str,
        operation: OperationKind,
        entity_id: i64,
        payload: &Payload,
    ) -> Result<i64> {
        let log = self.running_log()?;
        let id = log.append(entity_kind, operation, entity_id, payload).await?;

        if self.replayer.is_some() && self.online.is_online() {
            self.trigger.notify_one();
        }
        Ok(id)
    }

    /// [`queue()`](Self::queue) with a flat JSON object as the payload.
    pub async fn queue_json(
        &self,
        entity_kind: &str,
        operation: OperationKind,
        entity_id: i64,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let payload = Payload::from_json(payload)?;
        self.queue(entity_kind, operation, entity_id, &payload).await
    }

    /// Run one drain pass now.
    ///
    /// Fails with [`ReplicationError::Offline`] when the remote is not
    /// reachable; no entry changes status in that case.
    pub async fn force_sync(&self) -> Result<DrainStats> {
        self.running_log()?;
        let Some(ref replayer) = self.replayer else {
            return Err(ReplicationError::Offline);
        };
        if !self.online.is_online() {
            return Err(ReplicationError::Offline);
        }
        replayer.drain_once(self.config.settings.drain.batch_size).await
    }

    /// Online flag and per-status entry counts.
    pub async fn stats(&self) -> Result<EngineStats> {
        let counts = self.running_log()?.counts().await?;
        metrics::set_status_counts(counts.pending, counts.synced, counts.failed);
        Ok(EngineStats {
            online: self.online.is_online(),
            pending: counts.pending,
            synced: counts.synced,
            failed: counts.failed,
        })
    }

    /// Oldest pending entries.
    pub async fn pending(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.running_log()?.list_by_status(EntryStatus::Pending, limit).await
    }

    /// Entries that reached the retry ceiling.
    pub async fn failed(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.running_log()?.list_by_status(EntryStatus::Failed, limit).await
    }

    /// Delete synced entries older than `retention`.
    pub async fn purge_synced(&self, retention: Duration) -> Result<u64> {
        self.running_log()?.purge_synced(retention).await
    }

    /// Probe the remote immediately instead of waiting for the health task.
    pub async fn probe_now(&self) -> Result<bool> {
        self.running_log()?;
        let monitor = self.monitor.as_ref().ok_or_else(|| {
            ReplicationError::Internal("health monitor missing while running".to_string())
        })?;

        let was_online = self.online.is_online();
        let online = monitor.probe_once().await;
        if online && !was_online && self.replayer.is_some() {
            self.trigger.notify_one();
        }
        Ok(online)
    }

    /// The operation log, for the application's own local queries.
    pub fn log(&self) -> Result<&Arc<OperationLog>> {
        self.running_log()
    }

    /// Stop the engine.
    ///
    /// Shutdown sequence:
    /// 1. Signal both background tasks to stop
    /// 2. Wait for each (bounded by `shutdown_timeout_sec`), aborting a task
    ///    that does not finish in time
    /// 3. Close the remote pool
    /// 4. Checkpoint and close the operation log
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        match self.state() {
            EngineState::Stopped | EngineState::ShuttingDown => {
                debug!("Engine already stopped");
                return;
            }
            EngineState::Created => {
                self.set_state(EngineState::Stopped);
                return;
            }
            _ => {}
        }

        info!("Stopping replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let timeout = self.config.settings.shutdown_timeout();
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    // Cancelling drops whatever remote connection the task holds,
                    // which pool close below would otherwise wait for.
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        self.replayer = None;
        self.monitor = None;
        if let Some(remote) = self.remote.take() {
            match tokio::time::timeout(timeout, remote.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to close remote store"),
                Err(_) => warn!("Timed out closing remote store"),
            }
        }
        if let Some(log) = self.log.take() {
            log.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}
