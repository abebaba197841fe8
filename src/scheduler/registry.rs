// SPDX-License-Identifier: MIT
//! Generational subscriber registry for scheduler channels.
//!
//! Subscriptions are stored in per-channel slot arenas. A handle carries the
//! slot index plus the generation it was issued for, so removal with a stale
//! or foreign handle is a no-op instead of evicting whoever reused the slot.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;

/// Callback invoked on every tick of the channel it is subscribed to.
pub type ChannelCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Opaque proof of a subscription; the only way to remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    channel: String,
    index: usize,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Slot {
    generation: u64,
    callback: Option<ChannelCallback>,
}

/// Named channel → slot arena of subscribers.
#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: HashMap<String, Vec<Slot>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on `channel` and return its handle.
    ///
    /// Vacant slots are reused with a bumped generation.
    pub fn subscribe(&mut self, channel: &str, callback: ChannelCallback) -> SubscriptionHandle {
        let slots = self.channels.entry(channel.to_string()).or_default();

        if let Some(index) = slots.iter().position(|s| s.callback.is_none()) {
            let slot = &mut slots[index];
            slot.generation += 1;
            slot.callback = Some(callback);
            return SubscriptionHandle {
                channel: channel.to_string(),
                index,
                generation: slot.generation,
            };
        }

        slots.push(Slot {
            generation: 0,
            callback: Some(callback),
        });
        SubscriptionHandle {
            channel: channel.to_string(),
            index: slots.len() - 1,
            generation: 0,
        }
    }

    /// Remove the subscription the handle was issued for.
    ///
    /// Returns `false` (and changes nothing) when the handle is unknown,
    /// already removed, or its slot has since been reissued.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> bool {
        let Some(slots) = self.channels.get_mut(&handle.channel) else {
            return false;
        };
        let Some(slot) = slots.get_mut(handle.index) else {
            return false;
        };
        if slot.generation != handle.generation || slot.callback.is_none() {
            return false;
        }
        slot.callback = None;
        true
    }

    /// Clone the callbacks currently subscribed to `channel`.
    ///
    /// Iterating over the snapshot keeps a tick safe against subscribers
    /// removing themselves (or others) mid-fan-out.
    pub fn snapshot(&self, channel: &str) -> Vec<ChannelCallback> {
        self.channels
            .get(channel)
            .map(|slots| slots.iter().filter_map(|s| s.callback.clone()).collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|slots| slots.iter().filter(|s| s.callback.is_some()).count())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.channels
            .values()
            .flat_map(|slots| slots.iter())
            .filter(|s| s.callback.is_some())
            .count()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
