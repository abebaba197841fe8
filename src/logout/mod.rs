// SPDX-License-Identifier: MIT
//! Logout orchestrator.
//!
//! Deterministic, idempotent teardown in five ordered phases:
//!
//! 1. server notification (bounded timeout, failure is a warning)
//! 2. scheduler/task cleanup (fatal — leaving schedulers running
//!    reintroduces the stale-instance problem)
//! 3. credential/data purge (fatal)
//! 4. in-process state reset (fatal)
//! 5. navigation-readiness signal
//!
//! A fatal phase failure aborts the remaining phases. The emergency path
//! runs only phases 2 and 3, for situations where full cleanup cannot be
//! guaranteed (a confirmed LOST session, a tripped stale-instance guard).
//! An in-flight flag makes concurrent invocations return
//! [`LogoutOutcome::AlreadyInProgress`] instead of re-running phase 1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::RemoteApi;
use crate::credentials::{load_identity, CredentialStore};
use crate::notify::{NotificationEvent, Notifier};
use crate::scheduler::TaskScheduler;
use crate::session::SessionVerifier;
use crate::storage::Storage;
use crate::sync::SyncEngine;

// ─── Phase descriptors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseId {
    ServerNotification,
    SchedulerCleanup,
    CredentialPurge,
    StateReset,
    NavigationSignal,
}

struct PhaseSpec {
    id: PhaseId,
    name: &'static str,
    fatal: bool,
}

const FULL_PHASES: [PhaseSpec; 5] = [
    PhaseSpec {
        id: PhaseId::ServerNotification,
        name: "server-notification",
        fatal: false,
    },
    PhaseSpec {
        id: PhaseId::SchedulerCleanup,
        name: "scheduler-cleanup",
        fatal: true,
    },
    PhaseSpec {
        id: PhaseId::CredentialPurge,
        name: "credential-purge",
        fatal: true,
    },
    PhaseSpec {
        id: PhaseId::StateReset,
        name: "state-reset",
        fatal: true,
    },
    PhaseSpec {
        id: PhaseId::NavigationSignal,
        name: "navigation-signal",
        fatal: false,
    },
];

/// Only the fatal-critical subset.
const EMERGENCY_PHASES: [PhaseSpec; 2] = [
    PhaseSpec {
        id: PhaseId::SchedulerCleanup,
        name: "scheduler-cleanup",
        fatal: true,
    },
    PhaseSpec {
        id: PhaseId::CredentialPurge,
        name: "credential-purge",
        fatal: true,
    },
];

// ─── Results ─────────────────────────────────────────────────────────────────

/// Outcome of one phase, in execution order.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Result of one logout invocation. Created fresh per run, never persisted.
#[derive(Debug, Clone)]
pub struct LogoutResult {
    pub logout_id: String,
    pub success: bool,
    pub duration: Duration,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub emergency: bool,
    pub phases: Vec<PhaseOutcome>,
}

/// Either a completed run or "someone else is already running one".
#[derive(Debug, Clone)]
pub enum LogoutOutcome {
    Completed(LogoutResult),
    AlreadyInProgress,
}

impl LogoutOutcome {
    pub fn result(&self) -> Option<&LogoutResult> {
        match self {
            LogoutOutcome::Completed(r) => Some(r),
            LogoutOutcome::AlreadyInProgress => None,
        }
    }
}

/// Read-only completeness report.
#[derive(Debug, Clone)]
pub struct LogoutVerification {
    pub complete: bool,
    pub issues: Vec<String>,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct LogoutOrchestrator {
    api: Arc<dyn RemoteApi>,
    scheduler: Arc<TaskScheduler>,
    engine: Arc<SyncEngine>,
    verifier: Arc<SessionVerifier>,
    storage: Arc<Storage>,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<Notifier>,
    server_notify_timeout: Duration,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LogoutOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        scheduler: Arc<TaskScheduler>,
        engine: Arc<SyncEngine>,
        verifier: Arc<SessionVerifier>,
        storage: Arc<Storage>,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<Notifier>,
        server_notify_timeout: Duration,
    ) -> Self {
        Self {
            api,
            scheduler,
            engine,
            verifier,
            storage,
            credentials,
            notifier,
            server_notify_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run all five phases.
    pub async fn perform_complete_logout(&self, force_offline: bool) -> LogoutOutcome {
        self.run(&FULL_PHASES, force_offline, false).await
    }

    /// Run only the fatal-critical subset (phases 2 and 3).
    pub async fn perform_emergency_logout(&self, reason: &str) -> LogoutOutcome {
        warn!(reason, "emergency logout");
        self.run(&EMERGENCY_PHASES, true, true).await
    }

    async fn run(
        &self,
        phases: &[PhaseSpec],
        force_offline: bool,
        emergency: bool,
    ) -> LogoutOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("logout already in progress — not starting another");
            return LogoutOutcome::AlreadyInProgress;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let logout_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut result = LogoutResult {
            logout_id: logout_id.clone(),
            success: true,
            duration: Duration::ZERO,
            warnings: Vec::new(),
            errors: Vec::new(),
            emergency,
            phases: Vec::new(),
        };
        info!(logout_id = %logout_id, emergency, "logout started");

        for spec in phases {
            let outcome = self.run_phase(spec.id, force_offline, emergency).await;
            let ok = outcome.is_ok();
            self.notifier.show(NotificationEvent::LogoutProgress {
                phase: spec.name.to_string(),
                ok,
            });
            match outcome {
                Ok(()) => {
                    result.phases.push(PhaseOutcome {
                        name: spec.name,
                        ok: true,
                        detail: None,
                    });
                }
                Err(e) => {
                    let detail = format!("{e:#}");
                    result.phases.push(PhaseOutcome {
                        name: spec.name,
                        ok: false,
                        detail: Some(detail.clone()),
                    });
                    if spec.fatal {
                        warn!(phase = spec.name, err = %detail, "fatal logout phase failed — aborting");
                        result.errors.push(format!("{}: {detail}", spec.name));
                        result.success = false;
                        break;
                    }
                    warn!(phase = spec.name, err = %detail, "logout phase failed — continuing");
                    result.warnings.push(format!("{}: {detail}", spec.name));
                }
            }
        }

        result.duration = started.elapsed();
        info!(
            logout_id = %logout_id,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            warnings = result.warnings.len(),
            errors = result.errors.len(),
            "logout finished"
        );
        LogoutOutcome::Completed(result)
    }

    async fn run_phase(
        &self,
        id: PhaseId,
        force_offline: bool,
        emergency: bool,
    ) -> anyhow::Result<()> {
        match id {
            PhaseId::ServerNotification => self.notify_server(force_offline).await,
            PhaseId::SchedulerCleanup => self.cleanup_schedulers(),
            PhaseId::CredentialPurge => self.purge_persisted().await,
            PhaseId::StateReset => {
                self.reset_in_process_state().await;
                Ok(())
            }
            PhaseId::NavigationSignal => {
                self.notifier
                    .show(NotificationEvent::NavigationReady { emergency });
                Ok(())
            }
        }
    }

    /// Phase 1: tell the server, within a bounded timeout.
    async fn notify_server(&self, force_offline: bool) -> anyhow::Result<()> {
        let (identity, tenant) = load_identity(self.credentials.as_ref())
            .await?
            .context("no persisted identity — server not notified")?;
        tokio::time::timeout(
            self.server_notify_timeout,
            self.api.logout(&identity, &tenant, force_offline),
        )
        .await
        .context("server logout timed out")?
        .context("server logout rejected")?;
        Ok(())
    }

    /// Phase 2: stop every channel and the self-rescheduling sync timer.
    fn cleanup_schedulers(&self) -> anyhow::Result<()> {
        self.scheduler.dispose();
        self.engine.stop();
        let remaining = self.scheduler.active_channel_count();
        if remaining > 0 {
            anyhow::bail!("{remaining} scheduler channels still active after dispose");
        }
        Ok(())
    }

    /// Phase 3: purge the secure store and the persisted identity keys.
    /// The logout epoch is stamped *before* clearing so an older instance
    /// comparing its snapshot sees the newer epoch even mid-purge.
    async fn purge_persisted(&self) -> anyhow::Result<()> {
        self.storage
            .set_logout_epoch_millis(Utc::now().timestamp_millis())
            .await?;
        self.credentials.clear_all().await?;
        self.storage.clear_identity().await?;
        Ok(())
    }

    /// Phase 4: reset in-process singletons.
    async fn reset_in_process_state(&self) {
        self.engine.reset().await;
        self.verifier.reset().await;
    }

    /// Read-only completeness check for callers and tests.
    pub async fn verify_logout_complete(&self) -> LogoutVerification {
        let mut issues = Vec::new();

        let channels = self.scheduler.active_channel_count();
        if channels > 0 {
            issues.push(format!("{channels} scheduler channels still active"));
        }
        if !self.engine.is_stopped() {
            issues.push("sync engine still running".to_string());
        }
        match self.storage.identity_absent().await {
            Ok(true) => {}
            Ok(false) => issues.push("persisted identity keys remain".to_string()),
            Err(e) => issues.push(format!("persisted store unreadable: {e:#}")),
        }
        match self.credentials.is_empty().await {
            Ok(true) => {}
            Ok(false) => issues.push("credential store not empty".to_string()),
            Err(e) => issues.push(format!("credential store unreadable: {e:#}")),
        }
        if self.engine.sends().await != 0 {
            issues.push("sync state not reset".to_string());
        }
        if self.verifier.last_check().await.is_some() {
            issues.push("session state not reset".to_string());
        }

        LogoutVerification {
            complete: issues.is_empty(),
            issues,
        }
    }
}
