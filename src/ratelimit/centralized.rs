//! Centralized rate limiter backed by the shared store.
//!
//! All state lives in the store and every admission runs as one atomic
//! script, so no more than `limit` attempts are admitted per window no
//! matter how many callers or instances race on the same key. Store failures
//! are returned to the caller untouched; deciding what to do about them is
//! the resilience layer's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{Decision, Limiter};
use super::key::RateLimitKey;
use super::policy::{Algorithm, LimitPolicy, PolicyTable};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, StoreError};
use crate::store::{AtomicScript, ScriptArg, ScriptStore};

/// Extra lifetime given to fixed-window buckets beyond the window itself.
const BUCKET_TTL_SLACK_MS: u64 = 1_000;

/// A rate limiter whose counters live in a [`ScriptStore`].
#[derive(Debug, Clone)]
pub struct CentralizedLimiter {
    store: Arc<dyn ScriptStore>,
    key_prefix: String,
    policies: PolicyTable,
    clock: SharedClock,
}

impl CentralizedLimiter {
    /// Create a limiter over `store` with the system clock.
    pub fn new(store: Arc<dyn ScriptStore>, key_prefix: impl Into<String>, policies: PolicyTable) -> Self {
        Self::with_clock(store, key_prefix, policies, Arc::new(SystemClock::new()))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(
        store: Arc<dyn ScriptStore>,
        key_prefix: impl Into<String>,
        policies: PolicyTable,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            policies,
            clock,
        }
    }

    /// The policy table used by [`is_allowed`](Self::is_allowed).
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Store key of the fixed-window bucket containing `now`.
    pub fn bucket_key(&self, key: &RateLimitKey, policy: &LimitPolicy, now: u64) -> String {
        let bucket = (now / 1000) / policy.window_secs.max(1);
        format!("{}:fw:{}:{}:{}", self.key_prefix, key, policy.window_secs, bucket)
    }

    /// Store key of the sliding-window ordered set.
    pub fn sliding_key(&self, key: &RateLimitKey, policy: &LimitPolicy) -> String {
        format!("{}:sw:{}:{}", self.key_prefix, key, policy.window_secs)
    }

    async fn check_fixed(&self, key: &RateLimitKey, policy: &LimitPolicy, now: u64) -> Result<Decision> {
        let window_ms = policy.window_millis();
        let bucket_key = self.bucket_key(key, policy, now);
        let bucket_end = ((now / 1000) / policy.window_secs.max(1) + 1) * window_ms;
        let args = [
            ScriptArg::from(policy.limit),
            ScriptArg::from(window_ms + BUCKET_TTL_SLACK_MS),
            ScriptArg::from(bucket_end.saturating_sub(now)),
        ];

        let reply = self
            .store
            .eval(AtomicScript::FixedWindowAdmit, &[bucket_key], &args)
            .await?;
        decision_from_reply(AtomicScript::FixedWindowAdmit, reply, policy.limit)
    }

    async fn check_sliding(&self, key: &RateLimitKey, policy: &LimitPolicy, now: u64) -> Result<Decision> {
        let member = format!("{}-{:08x}", now, rand::random::<u32>());
        let args = [
            ScriptArg::from(policy.limit),
            ScriptArg::from(policy.window_millis()),
            ScriptArg::from(now),
            ScriptArg::from(member),
        ];

        let reply = self
            .store
            .eval(AtomicScript::SlidingWindowAdmit, &[self.sliding_key(key, policy)], &args)
            .await?;
        decision_from_reply(AtomicScript::SlidingWindowAdmit, reply, policy.limit)
    }

    /// Check `key` against the policy for its scope.
    pub async fn is_allowed(&self, key: &RateLimitKey) -> Result<bool> {
        let policy = self.policies.for_key(key);
        Ok(self.check(key, &policy).await?.allowed)
    }

    /// Check `key` against an explicit policy.
    pub async fn is_allowed_with(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<bool> {
        Ok(self.check(key, policy).await?.allowed)
    }
}

fn decision_from_reply(script: AtomicScript, reply: i64, limit: u64) -> Result<Decision> {
    if reply > 0 {
        let used = reply as u64;
        Ok(Decision::admitted(limit, limit.saturating_sub(used)))
    } else if reply < 0 {
        Ok(Decision::denied(limit, Duration::from_millis(reply.unsigned_abs())))
    } else {
        Err(StoreError::Script(format!("{script} returned 0")).into())
    }
}

#[async_trait]
impl Limiter for CentralizedLimiter {
    async fn check(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<Decision> {
        let now = self.clock.now_millis();

        trace!(
            key = %key,
            limit = policy.limit,
            window_secs = policy.window_secs,
            algorithm = ?policy.algorithm,
            "Checking centralized rate limit"
        );

        let decision = match policy.algorithm {
            Algorithm::FixedWindow => self.check_fixed(key, policy, now).await?,
            Algorithm::SlidingWindow => self.check_sliding(key, policy, now).await?,
        };

        if !decision.allowed {
            debug!(
                key = %key,
                limit = policy.limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Centralized rate limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn usage(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<u64> {
        let now = self.clock.now_millis();
        let count = match policy.algorithm {
            Algorithm::FixedWindow => self.store.read_count(&self.bucket_key(key, policy, now)).await?,
            Algorithm::SlidingWindow => {
                let cutoff = now.saturating_sub(policy.window_millis());
                self.store
                    .count_since(&self.sliding_key(key, policy), cutoff)
                    .await?
            }
        };
        Ok(count)
    }

    async fn clear(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<()> {
        let now = self.clock.now_millis();
        let store_key = match policy.algorithm {
            Algorithm::FixedWindow => self.bucket_key(key, policy, now),
            Algorithm::SlidingWindow => self.sliding_key(key, policy),
        };
        self.store.delete(&store_key).await?;
        debug!(key = %key, store_key = %store_key, "Cleared centralized counter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::GatekeeperError;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;

    const HOUR: Duration = Duration::from_secs(3600);

    fn limiter_at(start: u64) -> (CentralizedLimiter, MemoryStore, ManualClock) {
        let clock = ManualClock::new(start);
        let shared: SharedClock = Arc::new(clock.clone());
        let store = MemoryStore::with_clock(shared.clone());
        let limiter = CentralizedLimiter::with_clock(
            Arc::new(store.clone()),
            "test",
            PolicyTable::default(),
            shared,
        );
        (limiter, store, clock)
    }

    fn key(id: &str) -> RateLimitKey {
        RateLimitKey::new("by-ip", id, "submission")
    }

    #[tokio::test]
    async fn test_fixed_window_limit_and_retry_after() {
        // 10 minutes into an hour bucket.
        let start = 1_700_000_000_000 / 3_600_000 * 3_600_000 + 600_000;
        let (limiter, _store, _clock) = limiter_at(start);
        let policy = LimitPolicy::fixed(5, HOUR);

        for i in 1..=5 {
            let d = limiter.check(&key("a"), &policy).await.unwrap();
            assert!(d.allowed, "request {} should be admitted", i);
            assert_eq!(d.remaining, 5 - i);
        }

        let denied = limiter.check(&key("a"), &policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 5);
        assert_eq!(denied.retry_after, Duration::from_secs(3000));
        assert_eq!(limiter.usage(&key("a"), &policy).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_on_next_bucket() {
        let (limiter, _store, clock) = limiter_at(60_000);
        let policy = LimitPolicy::fixed(1, Duration::from_secs(60));

        assert!(limiter.is_allowed_with(&key("a"), &policy).await.unwrap());
        assert!(!limiter.is_allowed_with(&key("a"), &policy).await.unwrap());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.is_allowed_with(&key("a"), &policy).await.unwrap());
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_burst_exceeds_limit() {
        let limit = 5;
        let window = Duration::from_secs(60);
        // One second before a bucket boundary.
        let (limiter, _store, clock) = limiter_at(120_000 - 1_000);
        let fixed = LimitPolicy::fixed(limit, window);

        let mut admitted_before = 0;
        for _ in 0..limit + 2 {
            if limiter.is_allowed_with(&key("f"), &fixed).await.unwrap() {
                admitted_before += 1;
            }
        }
        clock.advance(Duration::from_secs(1));
        let mut admitted_after = 0;
        for _ in 0..limit + 2 {
            if limiter.is_allowed_with(&key("f"), &fixed).await.unwrap() {
                admitted_after += 1;
            }
        }

        // Never more than `limit` per bucket...
        assert_eq!(admitted_before, limit);
        assert_eq!(admitted_after, limit);
        // ...but well over `limit` inside a two-second span.
        assert!(admitted_before + admitted_after > limit);
        assert!(admitted_before + admitted_after <= 2 * limit);
    }

    #[tokio::test]
    async fn test_sliding_window_has_no_boundary_burst() {
        let limit = 5;
        let window = Duration::from_secs(60);
        let (limiter, _store, clock) = limiter_at(120_000 - 1_000);
        let sliding = LimitPolicy::sliding(limit, window);

        let mut admitted = 0;
        for _ in 0..limit + 2 {
            if limiter.is_allowed_with(&key("s"), &sliding).await.unwrap() {
                admitted += 1;
            }
        }
        clock.advance(Duration::from_secs(1));
        for _ in 0..limit + 2 {
            if limiter.is_allowed_with(&key("s"), &sliding).await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, limit);

        let denied = limiter.check(&key("s"), &sliding).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_sliding_window_never_exceeds_limit_in_any_trailing_window() {
        let limit = 4u64;
        let window_ms = 10_000u64;
        let (limiter, _store, clock) = limiter_at(1_000_000);
        let policy = LimitPolicy::sliding(limit, Duration::from_millis(window_ms));

        // Irregular gaps, some bursts, some long pauses.
        let gaps = [0u64, 5, 300, 2_000, 1, 1, 7_000, 2_999, 3_000, 50, 9_999, 1, 0, 4_500, 5_500, 10_000];
        let mut admitted_at = Vec::new();
        for gap in gaps.iter().cycle().take(200) {
            clock.advance(Duration::from_millis(*gap));
            if limiter.is_allowed_with(&key("p"), &policy).await.unwrap() {
                admitted_at.push(clock.now_millis());
            }
        }

        for (i, t) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[..=i]
                .iter()
                .filter(|&&earlier| t - earlier < window_ms)
                .count() as u64;
            assert!(in_window <= limit, "{} admissions in window ending at {}", in_window, t);
        }
        assert!(admitted_at.len() as u64 > limit);
    }

    #[tokio::test]
    async fn test_sliding_usage_and_clear() {
        let (limiter, _store, clock) = limiter_at(1_000_000);
        let policy = LimitPolicy::sliding(3, Duration::from_secs(10));

        limiter.check(&key("u"), &policy).await.unwrap();
        clock.advance(Duration::from_secs(6));
        limiter.check(&key("u"), &policy).await.unwrap();
        assert_eq!(limiter.usage(&key("u"), &policy).await.unwrap(), 2);

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.usage(&key("u"), &policy).await.unwrap(), 1);

        limiter.clear(&key("u"), &policy).await.unwrap();
        assert_eq!(limiter.usage(&key("u"), &policy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_counter_fails_open() {
        let (limiter, store, clock) = limiter_at(0);
        let policy = LimitPolicy::fixed(2, Duration::from_secs(60));
        store.set_raw(&limiter.bucket_key(&key("c"), &policy, clock.now_millis()), "garbage");

        assert_eq!(limiter.usage(&key("c"), &policy).await.unwrap(), 0);
        let d = limiter.check(&key("c"), &policy).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let (limiter, _store, _clock) = limiter_at(1_000_000);
        let limiter = Arc::new(limiter);
        let policy = LimitPolicy::sliding(20, Duration::from_secs(60));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.is_allowed_with(&key("hot"), &policy).await.unwrap() })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(admitted, 20);
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let clock = ManualClock::new(0);
        let flaky = FlakyStore::new(Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))));
        let limiter = CentralizedLimiter::with_clock(
            Arc::new(flaky.clone()),
            "test",
            PolicyTable::default(),
            Arc::new(clock),
        );
        flaky.set_failing(true);

        let err = limiter.is_allowed(&key("x")).await.unwrap_err();
        assert!(matches!(err, GatekeeperError::Store(StoreError::Connection(_))));
    }

    #[test]
    fn test_zero_reply_is_an_error() {
        assert!(decision_from_reply(AtomicScript::FixedWindowAdmit, 0, 5).is_err());
        let denied = decision_from_reply(AtomicScript::FixedWindowAdmit, -1500, 5).unwrap();
        assert_eq!(denied.retry_after, Duration::from_millis(1500));
    }
}
