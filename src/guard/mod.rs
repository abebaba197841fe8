// SPDX-License-Identifier: MIT
//! Stale-instance ("zombie") guard.
//!
//! A coordinator that should have stopped — the user logged out, or a newer
//! instance logged in under a different identity — must not keep
//! transmitting. At startup the guard captures an immutable
//! [`IdentitySnapshot`]; on every tick it compares live persisted state
//! against that snapshot and triggers self-teardown on the first mismatch.
//! This is the principal defense against the duplicate-session race where a
//! new login begins before the old instance has fully stopped.
//!
//! The tick also runs a best-effort connectivity probe first, purely to keep
//! the transport warm; its outcome is ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::credentials::{CredentialField, CredentialStore};
use crate::storage::Storage;

/// Why the instance was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    IdentityChanged,
    TenantChanged,
    NewerLogoutEpoch,
    CredentialsAbsent,
    PermanentlyDisabled,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::IdentityChanged => write!(f, "persisted identity changed"),
            StaleReason::TenantChanged => write!(f, "persisted tenant changed"),
            StaleReason::NewerLogoutEpoch => write!(f, "newer logout epoch persisted"),
            StaleReason::CredentialsAbsent => write!(f, "persisted credentials absent"),
            StaleReason::PermanentlyDisabled => write!(f, "permanent disable flag set"),
        }
    }
}

/// Identity captured when the coordinator starts. Never mutated afterwards;
/// only compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    pub identity_token: String,
    pub tenant_code: String,
    pub logout_epoch_millis: i64,
}

impl IdentitySnapshot {
    /// Capture the current persisted identity. Fails when no identity is
    /// stored — a coordinator must not start unauthenticated.
    pub async fn capture(
        storage: &Storage,
        credentials: &dyn CredentialStore,
    ) -> anyhow::Result<Self> {
        let identity_token = credentials
            .get(CredentialField::IdentityToken)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no identity token stored"))?;
        let tenant_code = credentials
            .get(CredentialField::TenantCode)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no tenant code stored"))?;
        let logout_epoch_millis = storage.logout_epoch_millis().await?.unwrap_or(0);
        Ok(Self {
            identity_token,
            tenant_code,
            logout_epoch_millis,
        })
    }
}

/// Teardown hook invoked once when the instance is judged stale. Wired to
/// the logout orchestrator's emergency path.
pub type TeardownFn = Box<dyn Fn(StaleReason) -> BoxFuture<'static, ()> + Send + Sync>;

/// Compares live persisted state against the startup snapshot.
pub struct StaleInstanceGuard {
    snapshot: IdentitySnapshot,
    storage: Arc<Storage>,
    credentials: Arc<dyn CredentialStore>,
    connectivity: Arc<ConnectivityMonitor>,
    teardown: TeardownFn,
    tripped: AtomicBool,
}

impl StaleInstanceGuard {
    pub fn new(
        snapshot: IdentitySnapshot,
        storage: Arc<Storage>,
        credentials: Arc<dyn CredentialStore>,
        connectivity: Arc<ConnectivityMonitor>,
        teardown: TeardownFn,
    ) -> Self {
        Self {
            snapshot,
            storage,
            credentials,
            connectivity,
            teardown,
            tripped: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> &IdentitySnapshot {
        &self.snapshot
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// One guard pass: warm the transport, then compare persisted state
    /// against the snapshot. Never raises; the first mismatch fires the
    /// teardown hook exactly once.
    pub async fn tick(&self) {
        if self.is_tripped() {
            return;
        }

        // Best-effort warm-up; the result is deliberately ignored.
        self.connectivity.probe().await;

        let reason = match self.stale_reason().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(err = %e, "stale-instance check unreadable — will retry next tick");
                return;
            }
        };

        let Some(reason) = reason else {
            debug!("stale-instance check passed");
            return;
        };

        if self
            .tripped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        warn!(reason = %reason, "stale instance detected — tearing down");
        (self.teardown)(reason).await;
    }

    /// Evaluate the stale conditions against live persisted state.
    async fn stale_reason(&self) -> anyhow::Result<Option<StaleReason>> {
        if self.storage.permanent_disable().await?.is_some() {
            return Ok(Some(StaleReason::PermanentlyDisabled));
        }

        let epoch = self.storage.logout_epoch_millis().await?.unwrap_or(0);
        if epoch > self.snapshot.logout_epoch_millis {
            return Ok(Some(StaleReason::NewerLogoutEpoch));
        }

        let identity = self.credentials.get(CredentialField::IdentityToken).await?;
        let tenant = self.credentials.get(CredentialField::TenantCode).await?;
        match (identity, tenant) {
            (None, None) => Ok(Some(StaleReason::CredentialsAbsent)),
            (Some(identity), _) if identity != self.snapshot.identity_token => {
                Ok(Some(StaleReason::IdentityChanged))
            }
            (_, Some(tenant)) if tenant != self.snapshot.tenant_code => {
                Ok(Some(StaleReason::TenantChanged))
            }
            (None, _) | (_, None) => Ok(Some(StaleReason::CredentialsAbsent)),
            _ => Ok(None),
        }
    }

    /// Watchdog sweep: the permanent-disable flag auto-expires after a fixed
    /// window. Kept as a tunable constant, not load-bearing logic.
    pub async fn sweep_expired_disable(&self, expiry: Duration) {
        let set_at = match self.storage.permanent_disable().await {
            Ok(Some(epoch_ms)) => epoch_ms,
            Ok(None) => return,
            Err(e) => {
                warn!(err = %e, "disable-flag sweep failed");
                return;
            }
        };
        let age_ms = Utc::now().timestamp_millis().saturating_sub(set_at);
        if age_ms >= expiry.as_millis() as i64 {
            info!(age_ms, "permanent-disable flag expired — clearing");
            if let Err(e) = self.storage.clear_permanent_disable().await {
                warn!(err = %e, "failed to clear expired disable flag");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::notify::Notifier;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    struct Fixture {
        guard: StaleInstanceGuard,
        storage: Arc<Storage>,
        credentials: Arc<MemoryCredentialStore>,
        teardowns: Arc<AtomicU32>,
        last_reason: Arc<Mutex<Option<StaleReason>>>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let credentials = Arc::new(MemoryCredentialStore::with_identity(
            "tok_12345678",
            "DEP-01",
        ));
        storage.set_identity("tok_12345678", "DEP-01").await.unwrap();

        let snapshot = IdentitySnapshot::capture(&storage, credentials.as_ref())
            .await
            .unwrap();

        let teardowns = Arc::new(AtomicU32::new(0));
        let last_reason = Arc::new(Mutex::new(None));
        let t = teardowns.clone();
        let lr = last_reason.clone();
        let teardown: TeardownFn = Box::new(move |reason| {
            let t = t.clone();
            let lr = lr.clone();
            Box::pin(async move {
                t.fetch_add(1, Ordering::SeqCst);
                *lr.lock().await = Some(reason);
            })
        });

        let connectivity = Arc::new(ConnectivityMonitor::new(
            "http://127.0.0.1:9",
            Arc::new(Notifier::new()),
        ));
        let guard = StaleInstanceGuard::new(
            snapshot,
            storage.clone(),
            credentials.clone(),
            connectivity,
            teardown,
        );
        Fixture {
            guard,
            storage,
            credentials,
            teardowns,
            last_reason,
        }
    }

    #[tokio::test]
    async fn matching_state_does_not_trip() {
        let f = fixture().await;
        f.guard.tick().await;
        assert!(!f.guard.is_tripped());
        assert_eq!(f.teardowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn identity_switch_trips_once() {
        let f = fixture().await;
        f.credentials
            .set(CredentialField::IdentityToken, "tok_other")
            .await
            .unwrap();

        f.guard.tick().await;
        assert!(f.guard.is_tripped());
        assert_eq!(f.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(
            *f.last_reason.lock().await,
            Some(StaleReason::IdentityChanged)
        );

        // Tripped is terminal — no repeated teardown.
        f.guard.tick().await;
        assert_eq!(f.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn newer_logout_epoch_trips() {
        let f = fixture().await;
        let newer = f.guard.snapshot().logout_epoch_millis + 1;
        f.storage.set_logout_epoch_millis(newer).await.unwrap();

        f.guard.tick().await;
        assert_eq!(
            *f.last_reason.lock().await,
            Some(StaleReason::NewerLogoutEpoch)
        );
    }

    #[tokio::test]
    async fn absent_credentials_trip() {
        let f = fixture().await;
        f.credentials.clear_all().await.unwrap();

        f.guard.tick().await;
        assert_eq!(
            *f.last_reason.lock().await,
            Some(StaleReason::CredentialsAbsent)
        );
    }

    #[tokio::test]
    async fn disable_flag_trips_and_sweep_clears_expired() {
        let f = fixture().await;
        let hour_ago = Utc::now().timestamp_millis() - 3_600_000;
        f.storage.set_permanent_disable(hour_ago).await.unwrap();

        f.guard.tick().await;
        assert_eq!(
            *f.last_reason.lock().await,
            Some(StaleReason::PermanentlyDisabled)
        );

        // The flag is older than the expiry window — the sweep clears it.
        f.guard
            .sweep_expired_disable(Duration::from_secs(600))
            .await;
        assert_eq!(f.storage.permanent_disable().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sweep_keeps_recent_flag() {
        let f = fixture().await;
        let now = Utc::now().timestamp_millis();
        f.storage.set_permanent_disable(now).await.unwrap();

        f.guard
            .sweep_expired_disable(Duration::from_secs(600))
            .await;
        assert!(f.storage.permanent_disable().await.unwrap().is_some());
    }
}
