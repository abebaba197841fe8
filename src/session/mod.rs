// SPDX-License-Identifier: MIT
//! Session verifier.
//!
//! Tracks whether the user session is still valid on the remote service.
//! The state machine has two states, ACTIVE and LOST, with one hard rule:
//! a single "not logged in" response never invalidates the session. The
//! verifier re-asks on a delay schedule and any contradicting answer — a
//! "logged in" response or a non-authentication error — discards the episode
//! as transient. Only unanimous agreement moves the state to LOST; the caller
//! then clears credentials and forces logout.
//!
//! Concurrency: at most one verification is in flight. A concurrent call
//! returns [`VerifyOutcome::AlreadyRunning`] immediately — checks are never
//! queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::confirm::{confirm_with_schedule, ConfirmSchedule, ConfirmSignal};
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::{load_identity, CredentialStore};
use crate::notify::{NotificationEvent, Notifier};

/// Session verification tuning.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    /// Re-check schedule after a "not logged in" response.
    pub loss_confirm: ConfirmSchedule,
    /// Re-check schedule after an unauthorized response.
    pub auth_confirm: ConfirmSchedule,
    /// Consecutive soft failures before a user-visible warning.
    pub soft_failure_threshold: u32,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            loss_confirm: ConfirmSchedule::from_secs(&[3, 6]),
            auth_confirm: ConfirmSchedule::from_secs(&[2, 4, 8]),
            soft_failure_threshold: 3,
        }
    }
}

/// Session validity as last confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Lost,
}

/// Result of one verification pass. Errors never escape as `Err` — every
/// failure mode is folded into a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Session confirmed valid, or an apparent failure was discarded as
    /// transient.
    Active,
    /// Another verification is in flight; nothing was checked.
    AlreadyRunning,
    /// Connectivity is down — remote check skipped, not counted as failure.
    SkippedOffline,
    /// Session confirmed terminated. The caller must trigger teardown.
    Lost { reason: String },
}

struct SessionInner {
    status: SessionStatus,
    soft_failures: u32,
    last_check: Option<Instant>,
}

/// ACTIVE/LOST state machine with confirm-before-invalidate.
pub struct SessionVerifier {
    api: Arc<dyn RemoteApi>,
    credentials: Arc<dyn CredentialStore>,
    connectivity: Arc<ConnectivityMonitor>,
    notifier: Arc<Notifier>,
    tuning: SessionTuning,
    inner: RwLock<SessionInner>,
    in_flight: AtomicBool,
}

/// Releases the single-flight guard on every exit path.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionVerifier {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        credentials: Arc<dyn CredentialStore>,
        connectivity: Arc<ConnectivityMonitor>,
        notifier: Arc<Notifier>,
        tuning: SessionTuning,
    ) -> Self {
        Self {
            api,
            credentials,
            connectivity,
            notifier,
            tuning,
            inner: RwLock::new(SessionInner {
                status: SessionStatus::Active,
                soft_failures: 0,
                last_check: None,
            }),
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.read().await.status
    }

    pub async fn soft_failures(&self) -> u32 {
        self.inner.read().await.soft_failures
    }

    pub async fn last_check(&self) -> Option<Instant> {
        self.inner.read().await.last_check
    }

    /// Reset to a fresh ACTIVE state. Used by the logout orchestrator's
    /// in-process state-reset phase.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.status = SessionStatus::Active;
        inner.soft_failures = 0;
        inner.last_check = None;
    }

    /// Run one verification pass against the remote service.
    pub async fn verify(&self) -> VerifyOutcome {
        if self.inner.read().await.status == SessionStatus::Lost {
            return VerifyOutcome::Lost {
                reason: "session already lost".to_string(),
            };
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("verification already in flight — not queuing another");
            return VerifyOutcome::AlreadyRunning;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let outcome = self.verify_inner().await;
        self.inner.write().await.last_check = Some(Instant::now());
        outcome
    }

    async fn verify_inner(&self) -> VerifyOutcome {
        // Offline short-circuit: skipping is not a failure.
        if !self.connectivity.is_online().await {
            debug!("offline — skipping session check");
            self.inner.write().await.soft_failures = 0;
            return VerifyOutcome::SkippedOffline;
        }

        let identity = match load_identity(self.credentials.as_ref()).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                return self
                    .transition_lost("identity credentials missing".to_string())
                    .await;
            }
            Err(e) => {
                warn!(err = %e, "credential store unreadable during verification");
                return self.record_soft_failure(e.to_string()).await;
            }
        };
        let (identity, tenant) = identity;

        match self.api.check_status(&identity, &tenant).await {
            Ok(status) if status.logged_in => {
                self.inner.write().await.soft_failures = 0;
                VerifyOutcome::Active
            }
            Ok(_) => {
                info!("server reports not-logged-in — confirming before invalidating");
                self.confirm_termination(&identity, &tenant, &self.tuning.loss_confirm)
                    .await
            }
            Err(e) if e.is_fatal() => {
                // Malformed credential: no retry can fix it.
                self.transition_lost(e.to_string()).await
            }
            Err(e) if e.is_auth() => {
                info!(err = %e, "unauthorized response — confirming before invalidating");
                self.confirm_termination(&identity, &tenant, &self.tuning.auth_confirm)
                    .await
            }
            Err(e) => self.record_soft_failure(e.to_string()).await,
        }
    }

    /// Re-check the suspected termination on `schedule`. Attempt 0 is the
    /// already-observed trigger; re-checks query the server again.
    async fn confirm_termination(
        &self,
        identity: &str,
        tenant: &str,
        schedule: &ConfirmSchedule,
    ) -> VerifyOutcome {
        let verdict = confirm_with_schedule(schedule, |attempt| {
            let api = Arc::clone(&self.api);
            let identity = identity.to_string();
            let tenant = tenant.to_string();
            async move {
                if attempt == 0 {
                    return ConfirmSignal::Confirms;
                }
                match api.check_status(&identity, &tenant).await {
                    Ok(status) if status.logged_in => ConfirmSignal::Overturns,
                    Ok(_) => ConfirmSignal::Confirms,
                    Err(e) if e.is_auth() || e.is_fatal() => ConfirmSignal::Confirms,
                    // Timeouts and server errors are ambiguous — never a
                    // confirmed negative.
                    Err(_) => ConfirmSignal::Overturns,
                }
            }
        })
        .await;

        if verdict.is_confirmed() {
            self.transition_lost("session terminated by server".to_string())
                .await
        } else {
            debug!("termination not confirmed — session stays active");
            VerifyOutcome::Active
        }
    }

    async fn transition_lost(&self, reason: String) -> VerifyOutcome {
        {
            let mut inner = self.inner.write().await;
            if inner.status == SessionStatus::Lost {
                return VerifyOutcome::Lost { reason };
            }
            inner.status = SessionStatus::Lost;
        }
        warn!(reason = %reason, "session ACTIVE → LOST");
        self.notifier.show(NotificationEvent::SessionTerminated {
            reason: reason.clone(),
        });
        VerifyOutcome::Lost { reason }
    }

    async fn record_soft_failure(&self, last_error: String) -> VerifyOutcome {
        let mut inner = self.inner.write().await;
        inner.soft_failures += 1;
        let count = inner.soft_failures;
        if count >= self.tuning.soft_failure_threshold {
            inner.soft_failures = 0;
            drop(inner);
            self.notifier.show(NotificationEvent::SoftFailureWarning {
                consecutive: count,
                last_error,
            });
        } else {
            debug!(count, "soft failure recorded");
        }
        // Soft failures never change session state by themselves.
        VerifyOutcome::Active
    }
}
