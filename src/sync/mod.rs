// SPDX-License-Identifier: MIT
//! Adaptive telemetry sync engine.
//!
//! Decides whether and when to transmit telemetry. The send cadence follows
//! movement: a stationary device reports every 30s, a moving one every 15s,
//! a fast one every 5s. Redundant readings are filtered out, but significant
//! displacement or speed forces a send regardless of elapsed time.
//!
//! Unlike the task scheduler's fixed-period channels, the engine runs a
//! self-rescheduling one-shot timer: each pass sleeps for the freshly
//! computed interval, so a movement change takes effect on the very next
//! reschedule. Sends are strictly sequential — the next attempt is not
//! scheduled until the prior one resolves.
//!
//! SyncState is mutated only after a confirmed successful transmission; a
//! failed or aborted send leaves it untouched, interval included.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{RemoteApi, TelemetryPayload};
use crate::credentials::{load_identity, CredentialStore};
use crate::session::{SessionStatus, SessionVerifier, VerifyOutcome};
use crate::telemetry::{GeoPoint, Reading, SignalTier, TelemetryProvider};

// ─── Movement classification ─────────────────────────────────────────────────

/// Movement bucket derived from current speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementTier {
    Stationary,
    Moving,
    Fast,
}

impl std::fmt::Display for MovementTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementTier::Stationary => write!(f, "stationary"),
            MovementTier::Moving => write!(f, "moving"),
            MovementTier::Fast => write!(f, "fast"),
        }
    }
}

/// Sync cadence tuning.
///
/// Canonical speed thresholds: below 0.5 m/s is stationary, at or above
/// 2.0 m/s is fast, anything between is moving.
#[derive(Debug, Clone)]
pub struct SyncTuning {
    /// Speeds below this are "stationary"; at or above it, "moving".
    pub stationary_below_mps: f64,
    /// Speeds at or above this are "fast".
    pub fast_at_or_above_mps: f64,
    pub stationary_interval: Duration,
    pub moving_interval: Duration,
    pub fast_interval: Duration,
    /// Positional deltas under this can be filtered as redundant.
    pub skip_distance_m: f64,
    /// Positional deltas at or above this always force a send.
    pub force_distance_m: f64,
    /// Maximum silence: a reading older than this is always sent.
    pub max_quiet: Duration,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            stationary_below_mps: 0.5,
            fast_at_or_above_mps: 2.0,
            stationary_interval: Duration::from_secs(30),
            moving_interval: Duration::from_secs(15),
            fast_interval: Duration::from_secs(5),
            skip_distance_m: 5.0,
            force_distance_m: 10.0,
            max_quiet: Duration::from_secs(60),
        }
    }
}

/// Classify `speed_mps` against the documented thresholds. Pure.
pub fn classify(speed_mps: f64, tuning: &SyncTuning) -> MovementTier {
    if speed_mps >= tuning.fast_at_or_above_mps {
        MovementTier::Fast
    } else if speed_mps >= tuning.stationary_below_mps {
        MovementTier::Moving
    } else {
        MovementTier::Stationary
    }
}

/// Send interval for a movement tier. Pure.
pub fn interval_for(tier: MovementTier, tuning: &SyncTuning) -> Duration {
    match tier {
        MovementTier::Stationary => tuning.stationary_interval,
        MovementTier::Moving => tuning.moving_interval,
        MovementTier::Fast => tuning.fast_interval,
    }
}

// ─── Smart filter ────────────────────────────────────────────────────────────

/// What the last successful transmission looked like.
#[derive(Debug, Clone, Copy)]
pub struct LastSent {
    pub position: GeoPoint,
    pub power_level: u8,
    pub signal_tier: SignalTier,
    pub at: Instant,
}

/// Smart-filtering rule: skip only when the reading is redundant on every
/// axis. Pure — `elapsed` is the time since `last` was transmitted.
pub fn should_send(
    last: Option<&LastSent>,
    reading: &Reading,
    elapsed: Duration,
    tuning: &SyncTuning,
) -> bool {
    let Some(last) = last else {
        // Nothing transmitted yet.
        return true;
    };

    let delta_m = last.position.distance_m(&reading.position);
    // Significant displacement or speed always forces a send.
    if delta_m >= tuning.force_distance_m {
        return true;
    }
    if reading.speed_mps >= tuning.stationary_below_mps {
        return true;
    }

    let redundant = delta_m < tuning.skip_distance_m
        && last.power_level == reading.power_level
        && last.signal_tier == reading.signal_tier
        && elapsed < tuning.max_quiet;
    !redundant
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Mutable sync state. Owned by the engine, mutated only after a confirmed
/// successful transmission.
#[derive(Debug)]
struct SyncState {
    last_sent: Option<LastSent>,
    current_interval: Duration,
    movement: MovementTier,
    sends: u64,
}

impl SyncState {
    fn fresh(tuning: &SyncTuning) -> Self {
        Self {
            last_sent: None,
            current_interval: tuning.stationary_interval,
            movement: MovementTier::Stationary,
            sends: 0,
        }
    }
}

/// Result of one sync pass. Failures are absorbed — nothing here stops the
/// reschedule loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent {
        tier: MovementTier,
        next_interval: Duration,
    },
    /// Filtered as redundant by [`should_send`].
    Skipped,
    /// The session verifier did not report an active session.
    Blocked { outcome: VerifyOutcome },
    /// The telemetry provider had no reading.
    NoReading { error: String },
    /// Transmission failed; SyncState is unchanged.
    Failed { error: String },
}

/// Adaptive sync engine with a self-rescheduling one-shot timer.
pub struct SyncEngine {
    provider: Arc<dyn TelemetryProvider>,
    api: Arc<dyn RemoteApi>,
    verifier: Arc<SessionVerifier>,
    credentials: Arc<dyn CredentialStore>,
    tuning: SyncTuning,
    state: RwLock<SyncState>,
    active: AtomicBool,
    wake: Notify,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        provider: Arc<dyn TelemetryProvider>,
        api: Arc<dyn RemoteApi>,
        verifier: Arc<SessionVerifier>,
        credentials: Arc<dyn CredentialStore>,
        tuning: SyncTuning,
    ) -> Arc<Self> {
        let state = RwLock::new(SyncState::fresh(&tuning));
        Arc::new(Self {
            provider,
            api,
            verifier,
            credentials,
            tuning,
            state,
            active: AtomicBool::new(true),
            wake: Notify::new(),
            driver: Mutex::new(None),
        })
    }

    /// Start the reschedule loop. Each pass sleeps for the current interval,
    /// runs one tick, and the new interval (if the send succeeded) applies to
    /// the next sleep.
    pub fn spawn(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let interval = engine.state.read().await.current_interval;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = engine.wake.notified() => {}
                }
                if !engine.active.load(Ordering::SeqCst) {
                    break;
                }
                let outcome = engine.tick().await;
                debug!(?outcome, "sync pass complete");
            }
            debug!("sync engine loop stopped");
        });
        *self.driver.lock().expect("sync driver slot poisoned") = Some(handle);
    }

    /// Cut the current sleep short so the next pass runs immediately.
    /// Used when a movement transition is observed between schedules.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Stop the reschedule loop cooperatively: an in-flight send completes
    /// but will not mutate state, and no further pass is scheduled.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        !self.active.load(Ordering::SeqCst)
    }

    /// Reset to a fresh state. Used by the logout orchestrator's in-process
    /// state-reset phase.
    pub async fn reset(&self) {
        *self.state.write().await = SyncState::fresh(&self.tuning);
    }

    pub async fn current_interval(&self) -> Duration {
        self.state.read().await.current_interval
    }

    pub async fn movement(&self) -> MovementTier {
        self.state.read().await.movement
    }

    pub async fn sends(&self) -> u64 {
        self.state.read().await.sends
    }

    /// One full send sequence: read, gate on the session, filter, build,
    /// transmit, commit.
    pub async fn tick(&self) -> SendOutcome {
        let reading = match self.provider.current_reading().await {
            Ok(r) => r,
            Err(e) => {
                debug!(err = %e, "no telemetry reading available");
                return SendOutcome::NoReading {
                    error: e.to_string(),
                };
            }
        };

        match self.verifier.verify().await {
            VerifyOutcome::Active => {}
            VerifyOutcome::AlreadyRunning => {
                // A check is underway on another channel; trust the last
                // confirmed state rather than queue a second check.
                if self.verifier.status().await != SessionStatus::Active {
                    return SendOutcome::Blocked {
                        outcome: VerifyOutcome::AlreadyRunning,
                    };
                }
            }
            outcome => {
                debug!(?outcome, "send aborted — session not verified");
                return SendOutcome::Blocked { outcome };
            }
        }

        {
            let state = self.state.read().await;
            let elapsed = state
                .last_sent
                .as_ref()
                .map(|l| l.at.elapsed())
                .unwrap_or(Duration::MAX);
            if !should_send(state.last_sent.as_ref(), &reading, elapsed, &self.tuning) {
                debug!("reading filtered as redundant");
                return SendOutcome::Skipped;
            }
        }

        let Some((identity, tenant)) = load_identity(self.credentials.as_ref())
            .await
            .ok()
            .flatten()
        else {
            return SendOutcome::Failed {
                error: "identity credentials missing".to_string(),
            };
        };

        let tier = classify(reading.speed_mps, &self.tuning);
        let payload = TelemetryPayload::from_reading(&reading, tier);

        match self
            .api
            .transmit_telemetry(&identity, &tenant, &payload)
            .await
        {
            Ok(()) => {
                // The engine may have been stopped while the send was in
                // flight; a stopped engine no longer owns its state.
                if !self.active.load(Ordering::SeqCst) {
                    return SendOutcome::Sent {
                        tier,
                        next_interval: interval_for(tier, &self.tuning),
                    };
                }
                let next_interval = interval_for(tier, &self.tuning);
                let mut state = self.state.write().await;
                state.last_sent = Some(LastSent {
                    position: reading.position,
                    power_level: reading.power_level,
                    signal_tier: reading.signal_tier,
                    at: Instant::now(),
                });
                state.movement = tier;
                state.current_interval = next_interval;
                state.sends += 1;
                info!(
                    tier = %tier,
                    interval_s = next_interval.as_secs(),
                    sends = state.sends,
                    "telemetry transmitted"
                );
                SendOutcome::Sent {
                    tier,
                    next_interval,
                }
            }
            Err(e) => {
                warn!(err = %e, "telemetry transmission failed — state unchanged");
                SendOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SessionStatusResponse;
    use crate::connectivity::ConnectivityMonitor;
    use crate::credentials::MemoryCredentialStore;
    use crate::error::ApiError;
    use crate::notify::Notifier;
    use crate::session::SessionTuning;
    use crate::telemetry::FeedTelemetryProvider;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn tuning() -> SyncTuning {
        SyncTuning::default()
    }

    fn reading(lat: f64, lon: f64, speed: f64) -> Reading {
        Reading {
            position: GeoPoint::new(lat, lon),
            speed_mps: speed,
            power_level: 80,
            signal_tier: SignalTier::Good,
            captured_at_ms: 1_700_000_000_000,
        }
    }

    fn last_sent_at_origin() -> LastSent {
        LastSent {
            position: GeoPoint::new(0.0, 0.0),
            power_level: 80,
            signal_tier: SignalTier::Good,
            at: Instant::now(),
        }
    }

    // ── Pure functions ───────────────────────────────────────────────────────

    #[test]
    fn classification_boundaries() {
        let t = tuning();
        assert_eq!(classify(0.0, &t), MovementTier::Stationary);
        assert_eq!(classify(0.49, &t), MovementTier::Stationary);
        assert_eq!(classify(0.5, &t), MovementTier::Moving);
        assert_eq!(classify(1.99, &t), MovementTier::Moving);
        assert_eq!(classify(2.0, &t), MovementTier::Fast);
        assert_eq!(classify(3.0, &t), MovementTier::Fast);
    }

    #[test]
    fn intervals_follow_classification() {
        let t = tuning();
        assert_eq!(
            interval_for(MovementTier::Stationary, &t),
            Duration::from_secs(30)
        );
        assert_eq!(
            interval_for(MovementTier::Moving, &t),
            Duration::from_secs(15)
        );
        assert_eq!(interval_for(MovementTier::Fast, &t), Duration::from_secs(5));
    }

    #[test]
    fn small_delta_unchanged_levels_is_skipped() {
        // ~3 m displacement, same power/signal, 30s elapsed, stationary.
        let t = tuning();
        let last = last_sent_at_origin();
        let r = reading(0.000027, 0.0, 0.0);
        assert!(!should_send(
            Some(&last),
            &r,
            Duration::from_secs(30),
            &t
        ));
    }

    #[test]
    fn large_delta_forces_send() {
        // ~15 m displacement at the same elapsed time.
        let t = tuning();
        let last = last_sent_at_origin();
        let r = reading(0.000135, 0.0, 0.0);
        assert!(should_send(Some(&last), &r, Duration::from_secs(30), &t));
    }

    #[test]
    fn moving_speed_forces_send_regardless_of_delta() {
        let t = tuning();
        let last = last_sent_at_origin();
        let r = reading(0.0, 0.0, 0.5);
        assert!(should_send(Some(&last), &r, Duration::from_secs(1), &t));
    }

    #[test]
    fn stale_reading_is_always_sent() {
        let t = tuning();
        let last = last_sent_at_origin();
        let r = reading(0.0, 0.0, 0.0);
        assert!(should_send(Some(&last), &r, Duration::from_secs(60), &t));
    }

    #[test]
    fn power_change_defeats_filter() {
        let t = tuning();
        let last = last_sent_at_origin();
        let mut r = reading(0.0, 0.0, 0.0);
        r.power_level = 79;
        assert!(should_send(Some(&last), &r, Duration::from_secs(10), &t));
    }

    #[test]
    fn first_reading_is_always_sent() {
        let t = tuning();
        let r = reading(0.0, 0.0, 0.0);
        assert!(should_send(None, &r, Duration::ZERO, &t));
    }

    // ── Engine ───────────────────────────────────────────────────────────────

    /// Always-logged-in API whose transmit can be toggled to fail.
    struct ToggleApi {
        fail_transmit: AtomicBool,
        transmits: AtomicU32,
    }

    impl ToggleApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_transmit: AtomicBool::new(false),
                transmits: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteApi for ToggleApi {
        async fn check_status(
            &self,
            _identity: &str,
            _tenant: &str,
        ) -> Result<SessionStatusResponse, ApiError> {
            Ok(SessionStatusResponse { logged_in: true })
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
            self.transmits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn logout(
            &self,
            _identity: &str,
            _tenant: &str,
            _force_offline: bool,
        ) -> Result<(), ApiError> {
            Ok(())
        }

        async fn login(&self, _identity: &str, _tenant: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn engine_with(api: Arc<ToggleApi>) -> (Arc<SyncEngine>, Arc<FeedTelemetryProvider>) {
        let provider = Arc::new(FeedTelemetryProvider::new());
        let notifier = Arc::new(Notifier::new());
        let credentials = Arc::new(MemoryCredentialStore::with_identity(
            "tok_12345678",
            "DEP-01",
        ));
        let verifier = Arc::new(SessionVerifier::new(
            api.clone(),
            credentials.clone(),
            Arc::new(ConnectivityMonitor::new(
                "http://127.0.0.1:9",
                notifier.clone(),
            )),
            notifier,
            SessionTuning::default(),
        ));
        let engine = SyncEngine::new(
            provider.clone(),
            api,
            verifier,
            credentials,
            tuning(),
        );
        (engine, provider)
    }

    #[tokio::test]
    async fn no_reading_is_absorbed() {
        let (engine, _provider) = engine_with(ToggleApi::new());
        assert!(matches!(
            engine.tick().await,
            SendOutcome::NoReading { .. }
        ));
    }

    #[tokio::test]
    async fn fast_reading_sends_and_shortens_interval() {
        let api = ToggleApi::new();
        let (engine, provider) = engine_with(api.clone());

        // ~15 m from origin at 3.0 m/s → fast, must send.
        provider.publish(reading(0.0001, 0.0001, 3.0));
        let outcome = engine.tick().await;
        assert_eq!(
            outcome,
            SendOutcome::Sent {
                tier: MovementTier::Fast,
                next_interval: Duration::from_secs(5),
            }
        );
        assert_eq!(engine.current_interval().await, Duration::from_secs(5));
        assert_eq!(engine.movement().await, MovementTier::Fast);
        assert_eq!(api.transmits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn redundant_reading_is_skipped() {
        let api = ToggleApi::new();
        let (engine, provider) = engine_with(api.clone());

        provider.publish(reading(0.0, 0.0, 0.0));
        assert!(matches!(engine.tick().await, SendOutcome::Sent { .. }));

        // Same spot, same levels, just transmitted → filtered.
        provider.publish(reading(0.0, 0.0, 0.0));
        assert_eq!(engine.tick().await, SendOutcome::Skipped);
        assert_eq!(api.transmits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_transmission_leaves_state_unchanged() {
        let api = ToggleApi::new();
        let (engine, provider) = engine_with(api.clone());

        provider.publish(reading(0.0, 0.0, 0.0));
        assert!(matches!(engine.tick().await, SendOutcome::Sent { .. }));
        let interval_before = engine.current_interval().await;
        let sends_before = engine.sends().await;

        api.fail_transmit.store(true, Ordering::SeqCst);
        provider.publish(reading(0.001, 0.001, 3.0));
        assert!(matches!(engine.tick().await, SendOutcome::Failed { .. }));

        assert_eq!(engine.current_interval().await, interval_before);
        assert_eq!(engine.sends().await, sends_before);
        // Movement stays at the last committed classification.
        assert_eq!(engine.movement().await, MovementTier::Stationary);
    }

    #[tokio::test]
    async fn stopped_engine_does_not_commit_state() {
        let api = ToggleApi::new();
        let (engine, provider) = engine_with(api.clone());

        provider.publish(reading(0.0001, 0.0001, 3.0));
        engine.stop();
        assert!(matches!(engine.tick().await, SendOutcome::Sent { .. }));
        // The transmission happened but the stopped engine kept its state.
        assert_eq!(engine.sends().await, 0);
        assert!(engine.is_stopped());
    }

    #[tokio::test]
    async fn reset_restores_fresh_state() {
        let api = ToggleApi::new();
        let (engine, provider) = engine_with(api);

        provider.publish(reading(0.0001, 0.0001, 3.0));
        assert!(matches!(engine.tick().await, SendOutcome::Sent { .. }));
        assert_eq!(engine.movement().await, MovementTier::Fast);

        engine.reset().await;
        assert_eq!(engine.movement().await, MovementTier::Stationary);
        assert_eq!(engine.current_interval().await, Duration::from_secs(30));
        assert_eq!(engine.sends().await, 0);
    }
}
