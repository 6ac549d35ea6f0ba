// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication worker task.
//!
//! Drains the operation log when any of these fire:
//! - the periodic timer (`drain.interval_sec`)
//! - the trigger, notified by `queue()` and by the health monitor coming online
//! - a full, productive batch on the previous pass (there may be more behind it)
//!
//! A cycle is skipped while offline; nothing is read from the log.

use crate::config::DrainConfig;
use crate::health::OnlineState;
use crate::metrics;
use crate::replay::Replayer;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn, Instrument};

/// Run the drain task until shutdown is signaled.
///
/// An in-flight pass is allowed to finish; shutdown is observed between passes.
pub(super) async fn run_drain(
    replayer: Arc<Replayer>,
    online: Arc<OnlineState>,
    trigger: Arc<Notify>,
    config: DrainConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("drain");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        let interval = config.interval();
        info!(
            interval_secs = interval.as_secs(),
            batch_size = config.batch_size,
            "Starting drain task"
        );

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping drain task");
                        break;
                    }
                    continue;
                }

                _ = trigger.notified() => {
                    debug!("Drain triggered");
                }

                _ = timer.tick() => {}
            }

            if !online.is_online() {
                debug!("Remote offline, skipping drain cycle");
                metrics::record_drain_skipped("offline");
                continue;
            }

            match replayer.drain_once(config.batch_size).await {
                Ok(stats) => {
                    if stats.attempted >= config.batch_size && stats.synced > 0 {
                        trigger.notify_one();
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Drain pass failed, retrying next cycle");
                    metrics::record_error(e.kind());
                }
                Err(e) => {
                    error!(error = %e, "Drain pass failed");
                    metrics::record_error(e.kind());
                }
            }
        }
    }
    .instrument(span)
    .await
}
