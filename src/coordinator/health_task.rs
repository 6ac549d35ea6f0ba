// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic remote probe.
//!
//! Probes every `health.interval_sec` until shutdown. When the remote comes
//! back the drain task is woken so the backlog starts moving without waiting
//! for its own timer.

use crate::health::HealthMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, Instrument};

/// Run the health monitor task until shutdown is signaled.
pub(super) async fn run_health(
    monitor: Arc<HealthMonitor>,
    interval: Duration,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("health_monitor");

    async move {
        let _ = shutdown_rx.borrow_and_update();

        info!(interval_secs = interval.as_secs(), "Starting health monitor task");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The engine already probed during start().
        timer.tick().await;

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping health monitor");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let was_online = monitor.state().is_online();
            let online = monitor.probe_once().await;
            if online && !was_online {
                debug!("Back online, waking drain task");
                trigger.notify_one();
            }
        }
    }
    .instrument(span)
    .await
}
