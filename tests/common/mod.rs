//! Shared test utilities for engine and chaos tests.
//!
//! This module provides:
//! - PostgreSQL testcontainer setup
//! - A switchable remote store over a real SQLite file
//! - Polling helpers for background-task assertions

pub mod containers;
pub mod remote;

#[allow(unused_imports)]
pub use containers::*;
pub use remote::*;

use oplog_replicator::{EngineConfig, EngineStats, ReplicationEngine};
use std::path::Path;
use std::time::Duration;

/// Engine config with fast intervals and a local store under `dir`.
#[allow(dead_code)]
pub fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig::for_testing(&dir.join("local.db").to_string_lossy())
}

/// Poll `stats()` until `done` holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_for_stats<F>(engine: &ReplicationEngine, timeout: Duration, done: F) -> EngineStats
where
    F: Fn(&EngineStats) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let stats = engine.stats().await.expect("stats");
        if done(&stats) || tokio::time::Instant::now() >= deadline {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
