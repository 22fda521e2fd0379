//! Limiter capability shared by the in-process and centralized strategies.

use std::time::Duration;

use async_trait::async_trait;

use super::key::RateLimitKey;
use super::policy::LimitPolicy;
use crate::error::Result;

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the attempt was admitted
    pub allowed: bool,
    /// The configured limit for the bucket
    pub limit: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// How long to wait before retrying; zero when admitted
    pub retry_after: Duration,
}

impl Decision {
    /// An admitted attempt.
    pub fn admitted(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    /// A denied attempt.
    pub fn denied(limit: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after,
        }
    }

    /// Retry-after rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Trait for limiter implementations.
///
/// This trait abstracts over the in-process and centralized limiters so
/// the resilience wrapper can sit in front of either.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Count an attempt against `key` under `policy` and decide on it.
    async fn check(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<Decision>;

    /// Admissions recorded for `key` in the current window.
    async fn usage(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<u64>;

    /// Forget all admissions recorded for `key`.
    async fn clear(&self, key: &RateLimitKey, policy: &LimitPolicy) -> Result<()>;
}
