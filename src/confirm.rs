// SPDX-License-Identifier: MIT
//! Confirm-before-acting combinator.
//!
//! A single negative answer from the network is never trusted: before the
//! coordinator accepts a state transition as genuine it re-asks the question
//! on a fixed delay schedule, and the first contradicting answer discards the
//! whole episode as transient. Both retry sites — session-loss confirmation
//! (2 extra attempts, 3s/6s) and authentication-failure confirmation
//! (3 retries, 2s/4s/8s) — run through [`confirm_with_schedule`].
//!
//! # Example
//! ```rust,ignore
//! use trakd::confirm::{confirm_with_schedule, ConfirmSignal, Confirmation};
//!
//! let verdict = confirm_with_schedule(&schedule, |attempt| async move {
//!     match api.check_status(&identity, &tenant).await {
//!         Ok(s) if !s.logged_in => ConfirmSignal::Confirms,
//!         _ => ConfirmSignal::Overturns,
//!     }
//! })
//! .await;
//! ```

use std::time::Duration;
use tracing::{debug, warn};

/// What one probe attempt says about the suspected condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmSignal {
    /// The attempt agrees the condition is real.
    Confirms,
    /// The attempt contradicts the condition (or was too ambiguous to count —
    /// a timeout is never a confirmed negative).
    Overturns,
}

/// Final verdict after the initial probe plus every scheduled re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Every attempt agreed — the condition is genuine.
    Confirmed,
    /// Some attempt contradicted the condition. `attempt` is the 0-indexed
    /// probe that overturned it (0 = the initial probe).
    Overturned { attempt: u32 },
}

impl Confirmation {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Confirmation::Confirmed)
    }
}

/// Delay schedule between confirmation attempts.
///
/// Total attempts = `delays.len() + 1`: the initial probe runs immediately,
/// then one re-check after each delay.
#[derive(Debug, Clone)]
pub struct ConfirmSchedule {
    delays: Vec<Duration>,
}

impl ConfirmSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Build a schedule from whole seconds, e.g. `[3, 6]`.
    pub fn from_secs(secs: &[u64]) -> Self {
        Self {
            delays: secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// A schedule with no re-checks (the initial probe decides alone).
    /// Used by tests to keep runs instant.
    pub fn immediate() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn attempts(&self) -> u32 {
        self.delays.len() as u32 + 1
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Run the initial probe plus every scheduled re-check until one overturns.
///
/// `probe(attempt)` is called with the 0-indexed attempt number. Returns
/// [`Confirmation::Confirmed`] only when *every* attempt reported
/// [`ConfirmSignal::Confirms`]; the first `Overturns` short-circuits and
/// skips any remaining delays.
pub async fn confirm_with_schedule<F, Fut>(
    schedule: &ConfirmSchedule,
    mut probe: F,
) -> Confirmation
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = ConfirmSignal>,
{
    if probe(0).await == ConfirmSignal::Overturns {
        return Confirmation::Overturned { attempt: 0 };
    }

    for (i, delay) in schedule.delays.iter().enumerate() {
        let attempt = i as u32 + 1;
        debug!(
            attempt,
            total = schedule.attempts(),
            delay_ms = delay.as_millis(),
            "re-checking before acting"
        );
        tokio::time::sleep(*delay).await;
        if probe(attempt).await == ConfirmSignal::Overturns {
            debug!(attempt, "suspected condition overturned — discarding as transient");
            return Confirmation::Overturned { attempt };
        }
    }

    warn!(
        attempts = schedule.attempts(),
        "all confirmation attempts agree — condition accepted as genuine"
    );
    Confirmation::Confirmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn instant_schedule(rechecks: usize) -> ConfirmSchedule {
        ConfirmSchedule::new(vec![Duration::from_millis(1); rechecks])
    }

    #[tokio::test]
    async fn unanimous_agreement_confirms() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let verdict = confirm_with_schedule(&instant_schedule(2), |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                ConfirmSignal::Confirms
            }
        })
        .await;
        assert!(verdict.is_confirmed());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn first_contradiction_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let verdict = confirm_with_schedule(&instant_schedule(2), |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                if attempt == 1 {
                    ConfirmSignal::Overturns
                } else {
                    ConfirmSignal::Confirms
                }
            }
        })
        .await;
        assert_eq!(verdict, Confirmation::Overturned { attempt: 1 });
        // Initial probe + first re-check; the second re-check never runs.
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn initial_overturn_skips_all_delays() {
        let verdict = confirm_with_schedule(&instant_schedule(2), |_| async {
            ConfirmSignal::Overturns
        })
        .await;
        assert_eq!(verdict, Confirmation::Overturned { attempt: 0 });
    }

    #[tokio::test]
    async fn immediate_schedule_decides_on_first_probe() {
        let verdict = confirm_with_schedule(&ConfirmSchedule::immediate(), |_| async {
            ConfirmSignal::Confirms
        })
        .await;
        assert!(verdict.is_confirmed());
    }

    #[test]
    fn attempts_counts_initial_probe() {
        assert_eq!(ConfirmSchedule::from_secs(&[3, 6]).attempts(), 3);
        assert_eq!(ConfirmSchedule::immediate().attempts(), 1);
    }
}
