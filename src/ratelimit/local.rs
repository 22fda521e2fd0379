//! In-process rate limiter.
//!
//! Per-instance fixed-window counters in a concurrent map. Always available,
//! never blocks, and serves as the fallback when the shared store cannot be
//! used. Counts are only exact within this process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{Decision, Limiter};
use super::counter::WindowCounter;
use super::key::RateLimitKey;
use super::policy::{LimitPolicy, PolicyTable};
use crate::clock::{SharedClock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Slot {
    counter: WindowCounter,
    window_millis: u64,
}

/// The in-process rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct InProcessLimiter {
    /// Counters indexed by rate limit key
    counters: DashMap<RateLimitKey, Slot>,
    /// Policies used when the caller does not pass one
    policies: PolicyTable,
    clock: SharedClock,
}

impl InProcessLimiter {
    /// Create a limiter with the given policy table and the system clock.
    pub fn new(policies: PolicyTable) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock::new()))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(policies: PolicyTable, clock: SharedClock) -> Self {
        Self {
            counters: DashMap::new(),
            policies,
            clock,
        }
    }

    /// The policy table used by [`is_allowed`](Self::is_allowed).
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Count an attempt against `key` under `policy`.
    pub fn decide(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Decision {
        let now = self.clock.now_millis();
        let window_millis = policy.window_millis();
        let limit = policy.limit;

        let decision = match self.counters.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                debug!(key = %key, limit = limit, window_secs = policy.window_secs, "Creating new local counter");
                vacant.insert(Slot {
                    counter: WindowCounter::first(now),
                    window_millis,
                });
                Decision::admitted(limit, limit.saturating_sub(1))
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.window_millis = window_millis;
                if slot.counter.try_admit(now, limit, window_millis) {
                    let used = slot.counter.current_count(now, window_millis);
                    Decision::admitted(limit, limit.saturating_sub(used))
                } else {
                    Decision::denied(limit, slot.counter.duration_until_reset(now, window_millis))
                }
            }
        };

        trace!(key = %key, allowed = decision.allowed, remaining = decision.remaining, "Local rate limit check");
        decision
    }

    /// Check `key` against the policy for its scope.
    pub fn is_allowed(&self, key: &RateLimitKey) -> bool {
        let policy = self.policies.for_key(key);
        self.decide(key, &policy).allowed
    }

    /// Check `key` against an explicit policy.
    pub fn is_allowed_with(&self, key: &RateLimitKey, policy: &LimitPolicy) -> bool {
        self.decide(key, policy).allowed
    }

    /// Admissions counted for `key` in its current window.
    pub fn current_usage(&self, key: &RateLimitKey) -> u64 {
        let now = self.clock.now_millis();
        self.counters
            .get(key)
            .map(|slot| slot.counter.current_count(now, slot.window_millis))
            .unwrap_or(0)
    }

    /// Drop the counter for `key`.
    pub fn reset(&self, key: &RateLimitKey) {
        self.counters.remove(key);
    }

    /// Remove every counter whose window has elapsed.
    ///
    /// Safe to run concurrently with admission checks; a counter that is
    /// refreshed while the sweep runs is kept.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.counters.len();
        self.counters
            .retain(|_, slot| !slot.counter.is_expired(now, slot.window_millis));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.counters.len(), "Swept expired local counters");
        }
        removed
    }

    /// Spawn a task that calls [`sweep`](Self::sweep) every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }

    /// Get the number of live counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl Limiter for InProcessLimiter {
    async fn check(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<Decision> {
        Ok(self.decide(key, policy))
    }

    async fn usage(&self, key: &RateLimitKey, _policy: &LimitPolicy) -> Result<u64> {
        Ok(self.current_usage(key))
    }

    async fn clear(&self, key: &RateLimitKey, _policy: &LimitPolicy) -> Result<()> {
        self.reset(key);
        Ok(())
    }
}
