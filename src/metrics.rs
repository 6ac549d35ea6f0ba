// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Operation log writes and status transitions
//! - Drain cycles (replayed, failed, skipped)
//! - Remote reachability
//! - Local store contention
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `oplog_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only talks to the `metrics` facade; the host application picks
//! the exporter.
//!
//! # Usage
//!
//! ```rust,no_run
//! use oplog_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_append("kategori", "INSERT");
//! metrics::record_drain_cycle(10, 9, 1, Duration::from_millis(120));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Operation Log
// =============================================================================

/// Record an entry appended to the operation log.
pub fn record_append(entity_kind: &str, operation: &str) {
    counter!(
        "oplog_entries_appended_total",
        "entity_kind" => entity_kind.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an entry that reached the retry ceiling.
pub fn record_entry_failed(entity_kind: &str) {
    counter!("oplog_entries_failed_total", "entity_kind" => entity_kind.to_string()).increment(1);
}

/// Record synced entries deleted by retention.
pub fn record_purge(deleted: u64) {
    counter!("oplog_entries_purged_total").increment(deleted);
}

/// Record local SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn local_retries_total(operation: &str) {
    counter!("oplog_local_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Set the per-status entry gauges.
pub fn set_status_counts(pending: u64, synced: u64, failed: u64) {
    gauge!("oplog_entries", "status" => "pending").set(pending as f64);
    gauge!("oplog_entries", "status" => "synced").set(synced as f64);
    gauge!("oplog_entries", "status" => "failed").set(failed as f64);
}

// =============================================================================
// Replication Worker
// =============================================================================

/// Record a completed drain cycle.
pub fn record_drain_cycle(attempted: usize, synced: usize, failed: usize, duration: Duration) {
    counter!("oplog_drain_cycles_total").increment(1);
    counter!("oplog_replay_total", "outcome" => "synced").increment(synced as u64);
    if failed > 0 {
        counter!("oplog_replay_total", "outcome" => "failed").increment(failed as u64);
    }
    histogram!("oplog_drain_batch_size").record(attempted as f64);
    histogram!("oplog_drain_duration_seconds").record(duration.as_secs_f64());
}

/// Record a drain cycle that did not run.
pub fn record_drain_skipped(reason: &str) {
    counter!("oplog_drain_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record latency of a single remote statement.
pub fn record_replay_latency(operation: &str, duration: Duration) {
    histogram!("oplog_replay_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record errors by type.
pub fn record_error(error_type: &str) {
    counter!("oplog_errors_total", "error_type" => error_type.to_string()).increment(1);
}

// =============================================================================
// Health Monitor
// =============================================================================

/// Record a reachability probe.
pub fn record_probe(success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("oplog_remote_probes_total", "status" => status).increment(1);
    histogram!("oplog_remote_probe_latency_seconds").record(latency.as_secs_f64());
}

/// Record an online/offline transition.
pub fn record_connectivity_change(online: bool) {
    let to = if online { "online" } else { "offline" };
    counter!("oplog_connectivity_transitions_total", "to" => to).increment(1);
    gauge!("oplog_remote_online").set(if online { 1.0 } else { 0.0 });
}

// =============================================================================
// Engine
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("oplog_engine_state").set(value);
}
