// SPDX-License-Identifier: MIT
//! User-visible notification fan-out.
//!
//! Components report noteworthy transitions (connection lost/restored,
//! soft-failure warnings, session termination, logout progress) as
//! fire-and-forget [`NotificationEvent`]s. The [`Notifier`] logs each event,
//! rebroadcasts it on a tokio broadcast channel, and forwards it to any
//! registered [`NotificationPresenter`] — how a presenter renders the event
//! is its own business.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A user-visible transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NotificationEvent {
    /// Connectivity probe started failing.
    ConnectionLost,
    /// Connectivity probe recovered. `rtt_ms` is the successful probe's
    /// round-trip time.
    ConnectionRestored { rtt_ms: u64 },
    /// Soft failures reached the warning threshold. Dismissible, non-fatal.
    SoftFailureWarning { consecutive: u32, last_error: String },
    /// The session was confirmed terminated by the remote service.
    SessionTerminated { reason: String },
    /// One logout phase finished.
    LogoutProgress { phase: String, ok: bool },
    /// Teardown completed — safe to present the unauthenticated entry point.
    NavigationReady { emergency: bool },
}

impl NotificationEvent {
    /// Short machine-readable name, used in logs and presenter routing.
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::ConnectionLost => "connection_lost",
            NotificationEvent::ConnectionRestored { .. } => "connection_restored",
            NotificationEvent::SoftFailureWarning { .. } => "soft_failure_warning",
            NotificationEvent::SessionTerminated { .. } => "session_terminated",
            NotificationEvent::LogoutProgress { .. } => "logout_progress",
            NotificationEvent::NavigationReady { .. } => "navigation_ready",
        }
    }
}

/// Renders notification events to the user. Internals are out of scope here;
/// implementations must not block.
pub trait NotificationPresenter: Send + Sync {
    fn show(&self, event: &NotificationEvent);
}

/// Broadcasts notification events to presenters and channel subscribers.
pub struct Notifier {
    tx: broadcast::Sender<NotificationEvent>,
    presenters: Vec<Arc<dyn NotificationPresenter>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            presenters: Vec::new(),
        }
    }

    /// Attach a presenter. Builder-style, called during wiring.
    pub fn with_presenter(mut self, presenter: Arc<dyn NotificationPresenter>) -> Self {
        self.presenters.push(presenter);
        self
    }

    /// Fire-and-forget delivery: log, broadcast, forward to presenters.
    pub fn show(&self, event: NotificationEvent) {
        match &event {
            NotificationEvent::SessionTerminated { reason } => {
                warn!(reason = %reason, "session terminated");
            }
            NotificationEvent::SoftFailureWarning {
                consecutive,
                last_error,
            } => {
                warn!(consecutive, last_error = %last_error, "repeated soft failures");
            }
            other => {
                info!(kind = other.kind(), "notification");
            }
        }
        for presenter in &self.presenters {
            presenter.show(&event);
        }
        // Ignore errors — no subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
