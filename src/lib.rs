// SPDX-License-Identifier: MIT
//! trakd — device telemetry sync coordinator.
//!
//! Captures device telemetry (position, power level, signal quality) and
//! synchronizes it with a remote service while a user session is active.
//! The coordination core lives here: the periodic task scheduler, the
//! adaptive sync engine, the session-verification state machine, the
//! stale-instance guard, and the multi-phase logout orchestrator.

pub mod api;
pub mod config;
pub mod confirm;
pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod guard;
pub mod logout;
pub mod notify;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod sync;
pub mod telemetry;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use tracing::{debug, info};

use api::{validate_identity, RemoteApi};
use config::CoordinatorConfig;
use connectivity::ConnectivityMonitor;
use credentials::{CredentialField, CredentialStore};
use guard::{IdentitySnapshot, StaleInstanceGuard};
use logout::LogoutOrchestrator;
use notify::Notifier;
use scheduler::{
    TaskScheduler, CHANNEL_CONNECTIVITY, CHANNEL_HEARTBEAT, CHANNEL_LOCATION_MONITOR,
    CHANNEL_SESSION_CHECK, CHANNEL_WATCHDOG,
};
use session::{SessionVerifier, VerifyOutcome};
use storage::Storage;
use sync::{classify, SyncEngine};
use telemetry::TelemetryProvider;

/// Everything one coordinator instance owns, wired together at startup.
///
/// No process-wide singletons: constructing a second context yields a fully
/// independent coordinator, which is exactly what the stale-instance guard
/// exists to referee.
pub struct CoordinatorContext {
    pub config: Arc<CoordinatorConfig>,
    pub storage: Arc<Storage>,
    pub credentials: Arc<dyn CredentialStore>,
    pub api: Arc<dyn RemoteApi>,
    pub provider: Arc<dyn TelemetryProvider>,
    pub notifier: Arc<Notifier>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub scheduler: Arc<TaskScheduler>,
    pub verifier: Arc<SessionVerifier>,
    pub engine: Arc<SyncEngine>,
    pub logout: Arc<LogoutOrchestrator>,
    pub guard: Arc<StaleInstanceGuard>,
    pub started_at: Instant,
}

impl CoordinatorContext {
    /// Build and start a coordinator: wire every component, register the
    /// channel subscribers, start the scheduler and the sync engine.
    ///
    /// Requires a persisted identity — log in first.
    pub async fn start(
        config: Arc<CoordinatorConfig>,
        storage: Arc<Storage>,
        credentials: Arc<dyn CredentialStore>,
        api: Arc<dyn RemoteApi>,
        provider: Arc<dyn TelemetryProvider>,
    ) -> Result<Arc<Self>> {
        let notifier = Arc::new(Notifier::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(
            &config.api_base_url,
            notifier.clone(),
        ));
        let scheduler = TaskScheduler::new(config.channels.to_specs());

        let verifier = Arc::new(SessionVerifier::new(
            api.clone(),
            credentials.clone(),
            connectivity.clone(),
            notifier.clone(),
            config.session.to_tuning(),
        ));

        let engine = SyncEngine::new(
            provider.clone(),
            api.clone(),
            verifier.clone(),
            credentials.clone(),
            config.sync.to_tuning(),
        );

        let logout = Arc::new(LogoutOrchestrator::new(
            api.clone(),
            scheduler.clone(),
            engine.clone(),
            verifier.clone(),
            storage.clone(),
            credentials.clone(),
            notifier.clone(),
            config.server_notify_timeout(),
        ));

        // The snapshot is captured once, before any channel can fire, and is
        // immutable for the life of this instance.
        let snapshot = IdentitySnapshot::capture(&storage, credentials.as_ref())
            .await
            .context("cannot start coordinator without a persisted identity")?;
        let guard = Arc::new(StaleInstanceGuard::new(
            snapshot,
            storage.clone(),
            credentials.clone(),
            connectivity.clone(),
            teardown_hook(logout.clone()),
        ));

        let context = Arc::new(Self {
            config,
            storage,
            credentials,
            api,
            provider,
            notifier,
            connectivity,
            scheduler,
            verifier,
            engine,
            logout,
            guard,
            started_at: Instant::now(),
        });

        context.register_channels();
        context.scheduler.initialize();
        context.engine.spawn();
        info!("coordinator started");
        Ok(context)
    }

    /// Subscribe the coordination components to their channels.
    fn register_channels(self: &Arc<Self>) {
        // session-check: one verification pass; a confirmed loss triggers
        // the emergency teardown off-channel so scheduler disposal cannot
        // abort its own executor.
        {
            let verifier = self.verifier.clone();
            let logout = self.logout.clone();
            self.scheduler.on_channel(
                CHANNEL_SESSION_CHECK,
                Arc::new(move || {
                    let verifier = verifier.clone();
                    let logout = logout.clone();
                    Box::pin(async move {
                        if let VerifyOutcome::Lost { reason } = verifier.verify().await {
                            tokio::spawn(async move {
                                let _ = logout.perform_emergency_logout(&reason).await;
                            });
                        }
                        Ok(())
                    })
                }),
            );
        }

        // heartbeat: guarantees at least one server contact per minute even
        // on a quiet device, and logs a liveness line.
        {
            let verifier = self.verifier.clone();
            let engine = self.engine.clone();
            let started_at = self.started_at;
            self.scheduler.on_channel(
                CHANNEL_HEARTBEAT,
                Arc::new(move || {
                    let verifier = verifier.clone();
                    let engine = engine.clone();
                    Box::pin(async move {
                        let outcome = verifier.verify().await;
                        let sends = engine.sends().await;
                        let soft_failures = verifier.soft_failures().await;
                        info!(
                            uptime_s = started_at.elapsed().as_secs(),
                            sends = sends,
                            soft_failures = soft_failures,
                            outcome = ?outcome,
                            "heartbeat"
                        );
                        Ok(())
                    })
                }),
            );
        }

        // watchdog: disable-flag expiry sweep plus a coarse consistency audit.
        {
            let guard = self.guard.clone();
            let scheduler = self.scheduler.clone();
            let engine = self.engine.clone();
            let expiry = self.config.permanent_disable_expiry();
            self.scheduler.on_channel(
                CHANNEL_WATCHDOG,
                Arc::new(move || {
                    let guard = guard.clone();
                    let scheduler = scheduler.clone();
                    let engine = engine.clone();
                    Box::pin(async move {
                        guard.sweep_expired_disable(expiry).await;
                        debug!(
                            channels = scheduler.active_channel_count(),
                            subscribers = scheduler.total_subscribers(),
                            engine_stopped = engine.is_stopped(),
                            "watchdog audit"
                        );
                        Ok(())
                    })
                }),
            );
        }

        // connectivity-poll: keeps the online snapshot fresh.
        {
            let connectivity = self.connectivity.clone();
            self.scheduler.on_channel(
                CHANNEL_CONNECTIVITY,
                Arc::new(move || {
                    let connectivity = connectivity.clone();
                    Box::pin(async move {
                        connectivity.probe().await;
                        Ok(())
                    })
                }),
            );
        }

        // location-monitor: watches for movement-tier transitions so the
        // engine can reschedule immediately, and runs the stale-instance
        // guard at this channel's 5s cadence.
        {
            let provider = self.provider.clone();
            let engine = self.engine.clone();
            let guard = self.guard.clone();
            let tuning = self.config.sync.to_tuning();
            self.scheduler.on_channel(
                CHANNEL_LOCATION_MONITOR,
                Arc::new(move || {
                    let provider = provider.clone();
                    let engine = engine.clone();
                    let guard = guard.clone();
                    let tuning = tuning.clone();
                    Box::pin(async move {
                        if let Ok(reading) = provider.current_reading().await {
                            let observed = classify(reading.speed_mps, &tuning);
                            if observed != engine.movement().await {
                                debug!(tier = %observed, "movement transition — nudging sync engine");
                                engine.nudge();
                            }
                        }
                        guard.tick().await;
                        Ok(())
                    })
                }),
            );
        }
    }

    /// Convenience wrapper for a user-initiated full logout.
    pub async fn shutdown(&self) -> logout::LogoutOutcome {
        self.logout.perform_complete_logout(false).await
    }
}

/// Teardown hook for the stale-instance guard: run the emergency path on a
/// detached task, because phase 2 disposes the very scheduler whose channel
/// invoked the guard.
fn teardown_hook(logout: Arc<LogoutOrchestrator>) -> guard::TeardownFn {
    Box::new(move |reason| {
        let logout = logout.clone();
        Box::pin(async move {
            tokio::spawn(async move {
                let _ = logout.perform_emergency_logout(&reason.to_string()).await;
            });
        })
    })
}

/// Persist an identity and announce it to the remote service.
///
/// The validated identity lands in both the secure store and the persisted
/// settings, and any leftover permanent-disable flag is cleared so the new
/// session can start.
pub async fn perform_login(
    storage: &Storage,
    credentials: &dyn CredentialStore,
    api: &dyn RemoteApi,
    identity_token: &str,
    tenant_code: &str,
) -> Result<()> {
    validate_identity(identity_token).map_err(|e| anyhow::anyhow!(e))?;
    api.login(identity_token, tenant_code)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("server rejected login")?;

    credentials
        .set(CredentialField::IdentityToken, identity_token)
        .await?;
    credentials
        .set(CredentialField::TenantCode, tenant_code)
        .await?;
    storage.set_identity(identity_token, tenant_code).await?;
    storage.clear_permanent_disable().await?;
    info!(tenant = tenant_code, "login persisted");
    Ok(())
}
