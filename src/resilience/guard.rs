//! Circuit-breaker wrapper around a limiter.
//!
//! Every public operation returns a plain value and never an error. A call
//! goes to the primary limiter only when the breaker permits it; a rejected
//! permit, a store error or a timeout reroutes that single call to the
//! in-process limiter for the same key. Denials from a healthy primary are
//! returned as-is.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::breaker::{CircuitBreaker, SharedCircuitBreaker};
use crate::error::Result;
use crate::ratelimit::{Decision, InProcessLimiter, LimitPolicy, Limiter, PolicyTable, RateLimitKey};

/// A limiter that degrades to in-process counting when the primary fails.
#[derive(Debug)]
pub struct ResilientLimiter<L: Limiter> {
    primary: Arc<L>,
    fallback: Arc<InProcessLimiter>,
    breaker: SharedCircuitBreaker,
    request_timeout: Duration,
}

impl<L: Limiter> Clone for ResilientLimiter<L> {
    fn clone(&self) -> Self {
        Self {
            primary: Arc::clone(&self.primary),
            fallback: Arc::clone(&self.fallback),
            breaker: Arc::clone(&self.breaker),
            request_timeout: self.request_timeout,
        }
    }
}

impl<L: Limiter> ResilientLimiter<L> {
    /// Wrap `primary`, falling back to `fallback`.
    ///
    /// `request_timeout` bounds every primary call independently of any
    /// rate-limit window.
    pub fn new(
        primary: Arc<L>,
        fallback: Arc<InProcessLimiter>,
        breaker: SharedCircuitBreaker,
        request_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker,
            request_timeout,
        }
    }

    /// The breaker guarding the primary limiter.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The in-process fallback limiter.
    pub fn fallback(&self) -> &Arc<InProcessLimiter> {
        &self.fallback
    }

    /// Policies used when callers do not pass one.
    pub fn policies(&self) -> &PolicyTable {
        self.fallback.policies()
    }

    /// Run `call` against the primary if the breaker allows it.
    ///
    /// Returns `None` when the caller should use the fallback instead.
    async fn guarded<T, F, Fut>(&self, key: &RateLimitKey, operation: &'static str, call: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(permit) = self.breaker.try_acquire() else {
            debug!(
                key = %key,
                operation = operation,
                state = %self.breaker.state(),
                "Primary limiter not permitted, using fallback"
            );
            return None;
        };

        match tokio::time::timeout(self.request_timeout, call()).await {
            Ok(Ok(value)) => {
                self.breaker.on_success(permit);
                Some(value)
            }
            Ok(Err(err)) => {
                self.breaker.on_error(permit);
                warn!(key = %key, operation = operation, error = %err, "Primary limiter failed, using fallback");
                None
            }
            Err(_) => {
                self.breaker.on_error(permit);
                warn!(
                    key = %key,
                    operation = operation,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Primary limiter timed out, using fallback"
                );
                None
            }
        }
    }

    /// Decide on an attempt under an explicit policy.
    pub async fn decide(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Decision {
        match self.guarded(key, "check", || self.primary.check(key, policy)).await {
            Some(decision) => decision,
            None => self.fallback.decide(key, policy),
        }
    }

    /// Check `key` against the policy for its scope.
    pub async fn is_allowed(&self, key: &RateLimitKey) -> bool {
        let policy = self.policies().for_key(key);
        self.decide(key, &policy).await.allowed
    }

    /// Check `key` against an explicit limit and window.
    pub async fn is_allowed_with(&self, key: &RateLimitKey, policy: &LimitPolicy) -> bool {
        self.decide(key, policy).await.allowed
    }

    /// Admissions recorded for `key` under the policy for its scope.
    pub async fn usage(&self, key: &RateLimitKey) -> u64 {
        let policy = self.policies().for_key(key);
        self.usage_with(key, &policy).await
    }

    /// Admissions recorded for `key` under an explicit policy.
    pub async fn usage_with(&self, key: &RateLimitKey, policy: &LimitPolicy) -> u64 {
        match self.guarded(key, "usage", || self.primary.usage(key, policy)).await {
            Some(count) => count,
            None => self.fallback.current_usage(key),
        }
    }

    /// Forget `key` under the policy for its scope.
    pub async fn clear(&self, key: &RateLimitKey) {
        let policy = self.policies().for_key(key);
        self.clear_with(key, &policy).await
    }

    /// Forget `key` under an explicit policy.
    pub async fn clear_with(&self, key: &RateLimitKey, policy: &LimitPolicy) {
        if self
            .guarded(key, "clear", || self.primary.clear(key, policy))
            .await
            .is_none()
        {
            self.fallback.reset(key);
        }
    }

    /// Sweep expired fallback counters. Local only; bypasses the breaker.
    pub fn sweep_fallback(&self) -> usize {
        self.fallback.sweep()
    }

    /// Periodically sweep the fallback's counters.
    pub fn spawn_fallback_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.fallback.spawn_sweeper(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::ratelimit::CentralizedLimiter;
    use crate::resilience::{BreakerConfig, CircuitState};
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;

    struct Harness {
        limiter: ResilientLimiter<CentralizedLimiter>,
        store: FlakyStore,
        clock: ManualClock,
    }

    fn harness(timeout: Duration) -> Harness {
        let clock = ManualClock::new(1_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let store = FlakyStore::new(Arc::new(MemoryStore::with_clock(shared.clone())));
        let policies = PolicyTable::default();
        let primary = CentralizedLimiter::with_clock(
            Arc::new(store.clone()),
            "test",
            policies.clone(),
            shared.clone(),
        );
        let fallback = InProcessLimiter::with_clock(policies, shared.clone());
        let breaker = CircuitBreaker::with_clock(
            BreakerConfig {
                failure_rate_threshold: 50.0,
                minimum_calls: 2,
                sliding_window_size: 4,
                wait_duration_ms: 10_000,
                half_open_trials: 1,
            },
            shared,
        );
        Harness {
            limiter: ResilientLimiter::new(Arc::new(primary), Arc::new(fallback), Arc::new(breaker), timeout),
            store,
            clock,
        }
    }

    fn key() -> RateLimitKey {
        RateLimitKey::new("by-ip", "fp", "submission")
    }

    #[tokio::test]
    async fn test_healthy_primary_denials_are_honored() {
        let h = harness(Duration::from_secs(1));
        let policy = LimitPolicy::fixed(2, Duration::from_secs(60));

        assert!(h.limiter.is_allowed_with(&key(), &policy).await);
        assert!(h.limiter.is_allowed_with(&key(), &policy).await);
        assert!(!h.limiter.is_allowed_with(&key(), &policy).await);
        assert_eq!(h.limiter.usage_with(&key(), &policy).await, 2);
        // The fallback never saw these calls.
        assert_eq!(h.limiter.fallback().counter_count(), 0);
    }

    #[tokio::test]
    async fn test_store_error_reroutes_to_fallback() {
        let h = harness(Duration::from_secs(1));
        let policy = LimitPolicy::fixed(1, Duration::from_secs(60));
        h.store.set_failing(true);

        let decision = h.limiter.decide(&key(), &policy).await;
        assert!(decision.allowed);
        assert_eq!(h.limiter.fallback().current_usage(&key()), 1);
        assert_eq!(h.limiter.breaker().metrics().failed_calls, 1);

        // The fallback applies the same policy.
        assert!(!h.limiter.is_allowed_with(&key(), &policy).await);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let h = harness(Duration::from_millis(20));
        h.store.set_delay(Some(Duration::from_millis(200)));

        assert!(h.limiter.is_allowed(&key()).await);
        let metrics = h.limiter.breaker().metrics();
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(h.limiter.fallback().current_usage(&key()), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_primary_entirely() {
        let h = harness(Duration::from_secs(1));
        h.store.set_failing(true);
        h.limiter.is_allowed(&key()).await;
        h.limiter.is_allowed(&key()).await;
        assert_eq!(h.limiter.breaker().state(), CircuitState::Open);

        let calls = h.store.calls();
        h.limiter.is_allowed(&key()).await;
        h.limiter.usage(&key()).await;
        h.limiter.clear(&key()).await;
        assert_eq!(h.store.calls(), calls);
    }

    #[tokio::test]
    async fn test_recovery_closes_breaker() {
        let h = harness(Duration::from_secs(1));
        h.store.set_failing(true);
        h.limiter.is_allowed(&key()).await;
        h.limiter.is_allowed(&key()).await;
        assert_eq!(h.limiter.breaker().state(), CircuitState::Open);

        h.store.set_failing(false);
        h.clock.advance(Duration::from_secs(10));
        assert!(h.limiter.is_allowed(&key()).await);
        assert_eq!(h.limiter.breaker().state(), CircuitState::Closed);
        assert_eq!(h.limiter.usage(&key()).await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_does_not_wedge_half_open() {
        let h = harness(Duration::from_secs(1));
        h.store.set_failing(true);
        h.limiter.is_allowed(&key()).await;
        h.limiter.is_allowed(&key()).await;
        assert_eq!(h.limiter.breaker().state(), CircuitState::Open);

        h.store.set_failing(false);
        h.clock.advance(Duration::from_secs(10));
        h.store.set_delay(Some(Duration::from_millis(200)));
        let cancelled = tokio::time::timeout(Duration::from_millis(10), h.limiter.is_allowed(&key())).await;
        assert!(cancelled.is_err());
        assert_eq!(h.limiter.breaker().state(), CircuitState::Open);

        h.store.set_delay(None);
        h.clock.advance(Duration::from_secs(10));
        let calls = h.store.calls();
        assert!(h.limiter.is_allowed(&key()).await);
        assert_eq!(h.store.calls(), calls + 1);
        assert_eq!(h.limiter.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_clear_falls_back_to_local_reset() {
        let h = harness(Duration::from_secs(1));
        let policy = LimitPolicy::fixed(1, Duration::from_secs(60));
        h.store.set_failing(true);

        assert!(h.limiter.is_allowed_with(&key(), &policy).await);
        h.limiter.clear_with(&key(), &policy).await;
        assert_eq!(h.limiter.fallback().current_usage(&key()), 0);
    }

    #[tokio::test]
    async fn test_sweep_bypasses_breaker() {
        let h = harness(Duration::from_secs(1));
        h.store.set_failing(true);
        h.limiter
            .is_allowed_with(&key(), &LimitPolicy::fixed(1, Duration::from_secs(1)))
            .await;
        let calls = h.store.calls();

        h.clock.advance(Duration::from_secs(2));
        assert_eq!(h.limiter.sweep_fallback(), 1);
        assert_eq!(h.store.calls(), calls);
    }
}
