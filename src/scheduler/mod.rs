// SPDX-License-Identifier: MIT
//! Periodic task scheduler.
//!
//! Drives N independently configured named channels; every tick fans out to
//! all subscribers registered on that channel. A subscriber failure (error or
//! panic) is caught and logged — it never cancels the channel, never
//! deregisters the subscriber, and never starves the other subscribers on
//! the same tick.
//!
//! Channels are multiplexed onto the tokio runtime; `dispose` aborts the
//! channel drivers but lets an in-flight fan-out finish its current
//! callback — components re-check their own active flags before touching
//! shared state.

pub mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use registry::{ChannelCallback, SubscriptionHandle, SubscriptionRegistry};

// Default channel names. Periods are configured per channel spec.
pub const CHANNEL_SESSION_CHECK: &str = "session-check";
pub const CHANNEL_HEARTBEAT: &str = "heartbeat";
pub const CHANNEL_WATCHDOG: &str = "watchdog";
pub const CHANNEL_CONNECTIVITY: &str = "connectivity-poll";
pub const CHANNEL_LOCATION_MONITOR: &str = "location-monitor";

/// One named periodic channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub period: Duration,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
        }
    }
}

/// Fans periodic ticks out to channel subscribers.
pub struct TaskScheduler {
    channels: Vec<ChannelSpec>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl TaskScheduler {
    pub fn new(channels: Vec<ChannelSpec>) -> Arc<Self> {
        Arc::new(Self {
            channels,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
            drivers: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Spawn one driver task per configured channel. Idempotent — a second
    /// call is a no-op, and a call after `dispose` is refused.
    pub fn initialize(self: &Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) {
            warn!("scheduler already disposed — initialize refused");
            return;
        }
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scheduler already initialized");
            return;
        }

        let mut drivers = self.drivers.lock().expect("scheduler driver list poisoned");
        for spec in &self.channels {
            let name = spec.name.clone();
            let period = spec.period;
            let registry = Arc::clone(&self.registry);
            let scheduler = Arc::clone(self);

            drivers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the immediate first tick; the channel fires after one
                // full period, like every subsequent tick.
                interval.tick().await;

                loop {
                    interval.tick().await;
                    if scheduler.disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    let callbacks = {
                        let registry = registry.lock().expect("subscription registry poisoned");
                        registry.snapshot(&name)
                    };
                    for callback in callbacks {
                        run_isolated(&name, callback).await;
                    }
                }
            }));
        }
        info!(channels = self.channels.len(), "task scheduler initialized");
    }

    /// Register `callback` on the named channel and return its handle.
    pub fn on_channel(
        &self,
        channel: &str,
        callback: ChannelCallback,
    ) -> SubscriptionHandle {
        if !self.channels.iter().any(|c| c.name == channel) {
            debug!(channel, "subscribing to a channel with no driver — it will never tick");
        }
        self.registry
            .lock()
            .expect("subscription registry poisoned")
            .subscribe(channel, callback)
    }

    /// Remove a subscription. Unknown or already-removed handles are a no-op.
    pub fn remove_channel(&self, handle: &SubscriptionHandle) {
        let removed = self
            .registry
            .lock()
            .expect("subscription registry poisoned")
            .unsubscribe(handle);
        if !removed {
            debug!(channel = handle.channel(), "remove_channel: handle already gone");
        }
    }

    /// Cancel every channel driver and drop all subscriptions. Idempotent.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scheduler already disposed");
            return;
        }
        let mut drivers = self.drivers.lock().expect("scheduler driver list poisoned");
        for driver in drivers.drain(..) {
            driver.abort();
        }
        self.registry
            .lock()
            .expect("subscription registry poisoned")
            .clear();
        info!("task scheduler disposed");
    }

    /// Number of channel drivers still running. Zero after `dispose`.
    pub fn active_channel_count(&self) -> usize {
        if self.disposed.load(Ordering::SeqCst) {
            return 0;
        }
        self.drivers
            .lock()
            .expect("scheduler driver list poisoned")
            .iter()
            .filter(|d| !d.is_finished())
            .count()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .expect("subscription registry poisoned")
            .subscriber_count(channel)
    }

    pub fn total_subscribers(&self) -> usize {
        self.registry
            .lock()
            .expect("subscription registry poisoned")
            .total_subscribers()
    }
}

/// Run one subscriber, containing both `Err` returns and panics.
async fn run_isolated(channel: &str, callback: ChannelCallback) {
    match std::panic::AssertUnwindSafe(callback()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(channel, err = %e, "channel subscriber failed");
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(channel, panic = %msg, "channel subscriber panicked");
        }
    }
}
