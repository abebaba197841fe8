// SPDX-License-Identifier: MIT
//! Connectivity monitor.
//!
//! Probes the remote service's health endpoint on the `connectivity-poll`
//! channel, records round-trip time and a rolling loss window, and exposes an
//! online/offline snapshot. The session verifier short-circuits its remote
//! check while the monitor reports offline, and connection-lost/restored
//! notifications fire on state flips.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::notify::{NotificationEvent, Notifier};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LOSS_WINDOW: usize = 10;

/// Snapshot of connection quality.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectivitySnapshot {
    pub online: bool,
    /// Round-trip time of the last successful probe in milliseconds.
    /// 0 if not yet measured.
    pub rtt_ms: u64,
    /// Loss percentage over the last window. 0.0 if not yet measured.
    pub loss_pct: f32,
    /// Unix timestamp of the last probe, successful or not. 0 before the
    /// first probe.
    pub last_probe_at: i64,
}

impl Default for ConnectivitySnapshot {
    fn default() -> Self {
        // Optimistic before the first probe: unknown connectivity must not
        // trigger the offline short-circuit.
        Self {
            online: true,
            rtt_ms: 0,
            loss_pct: 0.0,
            last_probe_at: 0,
        }
    }
}

struct MonitorInner {
    snapshot: ConnectivitySnapshot,
    window: VecDeque<bool>,
}

/// Probes the service health endpoint and tracks online state.
pub struct ConnectivityMonitor {
    client: reqwest::Client,
    probe_url: String,
    inner: RwLock<MonitorInner>,
    notifier: Arc<Notifier>,
}

impl ConnectivityMonitor {
    pub fn new(api_base_url: &str, notifier: Arc<Notifier>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            probe_url: format!("{}/health", api_base_url.trim_end_matches('/')),
            inner: RwLock::new(MonitorInner {
                snapshot: ConnectivitySnapshot::default(),
                window: VecDeque::with_capacity(LOSS_WINDOW),
            }),
            notifier,
        }
    }

    /// Run one probe and update the snapshot. Called per connectivity-poll
    /// tick; also usable as a transport warm-up whose outcome the caller
    /// ignores.
    pub async fn probe(&self) {
        let started = Instant::now();
        let success = self
            .client
            .head(&self.probe_url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        let rtt_ms = started.elapsed().as_millis() as u64;

        let mut inner = self.inner.write().await;
        if inner.window.len() >= LOSS_WINDOW {
            inner.window.pop_front();
        }
        inner.window.push_back(success);

        let loss_count = inner.window.iter().filter(|&&ok| !ok).count();
        let loss_pct = (loss_count as f32 / inner.window.len() as f32) * 100.0;

        let was_online = inner.snapshot.online;
        let prev_rtt = inner.snapshot.rtt_ms;
        inner.snapshot = ConnectivitySnapshot {
            online: success,
            rtt_ms: if success { rtt_ms } else { prev_rtt },
            loss_pct,
            last_probe_at: chrono::Utc::now().timestamp(),
        };
        drop(inner);

        debug!(success, rtt_ms, loss_pct, "connectivity probe");

        if was_online && !success {
            warn!("connectivity lost");
            self.notifier.show(NotificationEvent::ConnectionLost);
        } else if !was_online && success {
            info!(rtt_ms, "connectivity restored");
            self.notifier
                .show(NotificationEvent::ConnectionRestored { rtt_ms });
        }
    }

    pub async fn is_online(&self) -> bool {
        self.inner.read().await.snapshot.online
    }

    pub async fn snapshot(&self) -> ConnectivitySnapshot {
        self.inner.read().await.snapshot.clone()
    }

    /// Force the online flag, bypassing the probe. Test hook.
    #[doc(hidden)]
    pub async fn set_online_for_test(&self, online: bool) {
        self.inner.write().await.snapshot.online = online;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_optimistically_online() {
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:9", Arc::new(Notifier::new()));
        assert!(monitor.is_online().await);
    }

    #[tokio::test]
    async fn failed_probe_flips_offline_and_notifies() {
        let notifier = Arc::new(Notifier::new());
        let mut rx = notifier.subscribe();
        // Port 9 (discard) — the probe cannot succeed.
        let monitor = ConnectivityMonitor::new("http://127.0.0.1:9", notifier);

        monitor.probe().await;
        assert!(!monitor.is_online().await);
        assert_eq!(rx.recv().await.unwrap().kind(), "connection_lost");

        // A second failure does not re-notify.
        monitor.probe().await;
        assert!(rx.try_recv().is_err());

        let snap = monitor.snapshot().await;
        assert_eq!(snap.loss_pct, 100.0);
        assert!(snap.last_probe_at > 0);
    }
}
