// SPDX-License-Identifier: MIT
//! Shared harness for integration tests: a scripted remote API, a fed
//! telemetry provider, and a fully wired coordinator over in-memory stores.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use trakd::api::{RemoteApi, SessionStatusResponse, TelemetryPayload};
use trakd::config::{
    ChannelsConfig, CoordinatorConfig, GuardConfig, LogoutConfig, SessionConfig, SyncConfig,
};
use trakd::credentials::MemoryCredentialStore;
use trakd::error::ApiError;
use trakd::storage::Storage;
use trakd::telemetry::{FeedTelemetryProvider, GeoPoint, Reading, SignalTier};
use trakd::CoordinatorContext;

pub const IDENTITY: &str = "tok_12345678";
pub const TENANT: &str = "DEP-01";

// ─── Scripted remote API ─────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub enum StatusReply {
    LoggedIn,
    NotLoggedIn,
    Unauthorized,
    ServerError,
}

/// Scripted `check_status` replies (last entry repeats) plus call counters
/// for every operation.
pub struct MockApi {
    script: Mutex<VecDeque<StatusReply>>,
    pub status_calls: AtomicU32,
    pub transmit_calls: AtomicU32,
    pub logout_calls: AtomicU32,
    pub login_calls: AtomicU32,
    pub fail_logout: AtomicBool,
    pub fail_transmit: AtomicBool,
    /// Artificial latency for the logout call, to hold phase 1 open while a
    /// concurrent invocation races the single-flight guard.
    pub logout_delay_ms: AtomicU64,
}

impl MockApi {
    pub fn scripted(script: Vec<StatusReply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            status_calls: AtomicU32::new(0),
            transmit_calls: AtomicU32::new(0),
            logout_calls: AtomicU32::new(0),
            login_calls: AtomicU32::new(0),
            fail_logout: AtomicBool::new(false),
            fail_transmit: AtomicBool::new(false),
            logout_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn always_logged_in() -> Arc<Self> {
        Self::scripted(vec![StatusReply::LoggedIn])
    }

    fn next_reply(&self) -> StatusReply {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().copied().unwrap_or(StatusReply::LoggedIn)
        }
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn check_status(
        &self,
        _identity: &str,
        _tenant: &str,
    ) -> Result<SessionStatusResponse, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            StatusReply::LoggedIn => Ok(SessionStatusResponse { logged_in: true }),
            StatusReply::NotLoggedIn => Ok(SessionStatusResponse { logged_in: false }),
            StatusReply::Unauthorized => Err(ApiError::Unauthorized { status: 401 }),
            StatusReply::ServerError => Err(ApiError::Server { status: 503 }),
        }
    }

    async fn transmit_telemetry(
        &self,
        _identity: &str,
        _tenant: &str,
        _payload: &TelemetryPayload,
    ) -> Result<(), ApiError> {
        if self.fail_transmit.load(Ordering::SeqCst) {
            return Err(ApiError::Server { status: 502 });
        }
        self.transmit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(
        &self,
        _identity: &str,
        _tenant: &str,
        _force_offline: bool,
    ) -> Result<(), ApiError> {
        let delay = self.logout_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(ApiError::Server { status: 500 });
        }
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn login(&self, _identity: &str, _tenant: &str) -> Result<(), ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

pub struct TestHarness {
    pub context: Arc<CoordinatorContext>,
    pub api: Arc<MockApi>,
    pub provider: Arc<FeedTelemetryProvider>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub storage: Arc<Storage>,
}

/// Channel cadences that effectively never fire — for tests that drive
/// components directly.
pub fn quiet_channels() -> ChannelsConfig {
    ChannelsConfig {
        session_check_secs: 3600,
        heartbeat_secs: 3600,
        watchdog_secs: 3600,
        connectivity_poll_secs: 3600,
        location_monitor_secs: 3600,
    }
}

/// Confirmation schedules with no delays — the initial observation decides.
pub fn instant_session() -> SessionConfig {
    SessionConfig {
        loss_confirm_delays_secs: vec![0],
        auth_retry_delays_secs: vec![0],
        soft_failure_threshold: 3,
    }
}

pub fn test_config(channels: ChannelsConfig, session: SessionConfig) -> CoordinatorConfig {
    CoordinatorConfig {
        data_dir: std::env::temp_dir().join("trakd-test"),
        log: "warn".to_string(),
        log_format: "pretty".to_string(),
        // Unroutable on purpose: nothing in the harness may depend on a
        // real network endpoint.
        api_base_url: "http://127.0.0.1:9".to_string(),
        channels,
        sync: SyncConfig::default(),
        session,
        guard: GuardConfig::default(),
        logout: LogoutConfig::default(),
    }
}

/// Start a coordinator over in-memory stores with a persisted identity.
pub async fn start_harness(api: Arc<MockApi>, config: CoordinatorConfig) -> TestHarness {
    let storage = Arc::new(Storage::in_memory().await.unwrap());
    storage.set_identity(IDENTITY, TENANT).await.unwrap();
    let credentials = Arc::new(MemoryCredentialStore::with_identity(IDENTITY, TENANT));
    let provider = Arc::new(FeedTelemetryProvider::new());

    let context = CoordinatorContext::start(
        Arc::new(config),
        storage.clone(),
        credentials.clone(),
        api.clone(),
        provider.clone(),
    )
    .await
    .expect("coordinator failed to start");

    TestHarness {
        context,
        api,
        provider,
        credentials,
        storage,
    }
}

pub fn reading(lat: f64, lon: f64, speed: f64) -> Reading {
    Reading {
        position: GeoPoint::new(lat, lon),
        speed_mps: speed,
        power_level: 80,
        signal_tier: SignalTier::Good,
        captured_at_ms: 1_700_000_000_000,
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
