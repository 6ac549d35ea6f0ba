// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote reachability tracking.
//!
//! [`OnlineState`] is the only piece of in-memory state shared between the
//! background tasks and the foreground path. Many readers (the drain task,
//! `queue`, `force_sync`, `stats`) and exactly one writer, the
//! [`HealthMonitor`].
//!
//! A probe is a bounded `ping()` on the remote store:
//!
//! ```text
//! ping ok            → online
//! ping error         → offline
//! ping timed out     → offline
//! no remote at all   → offline
//! ```
//!
//! Transitions are logged once (not on every probe) and counted in metrics.

use crate::metrics;
use crate::remote::RemoteStore;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Whether the remote store is currently reachable.
#[derive(Debug, Default)]
pub struct OnlineState {
    online: RwLock<bool>,
}

impl OnlineState {
    /// Starts offline until the first successful probe.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        *self.online.read()
    }

    /// Set the flag, returning the previous value.
    pub(crate) fn set(&self, online: bool) -> bool {
        let mut guard = self.online.write();
        std::mem::replace(&mut *guard, online)
    }
}

/// Probes the remote store and owns writes to [`OnlineState`].
pub struct HealthMonitor {
    state: Arc<OnlineState>,
    remote: Option<Arc<dyn RemoteStore>>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(state: Arc<OnlineState>, remote: Option<Arc<dyn RemoteStore>>, probe_timeout: Duration) -> Self {
        Self {
            state,
            remote,
            probe_timeout,
        }
    }

    /// The flag this monitor writes.
    pub fn state(&self) -> &Arc<OnlineState> {
        &self.state
    }

    /// Probe once and update the flag. Returns the new online value.
    pub async fn probe_once(&self) -> bool {
        let Some(ref remote) = self.remote else {
            return self.apply(false, Some("no remote store configured"));
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.probe_timeout, remote.ping()).await;
        let latency = start.elapsed();

        let (online, reason) = match result {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some(format!("probe timed out after {:?}", self.probe_timeout))),
        };

        metrics::record_probe(online, latency);
        debug!(online, latency_ms = latency.as_millis() as u64, "Remote probe complete");
        self.apply(online, reason.as_deref())
    }

    fn apply(&self, online: bool, reason: Option<&str>) -> bool {
        let was_online = self.state.set(online);
        if was_online != online {
            if online {
                info!("Remote store reachable, going online");
            } else {
                warn!(reason = reason.unwrap_or("unknown"), "Remote store unreachable, going offline");
            }
            metrics::record_connectivity_change(online);
        }
        online
    }
}
