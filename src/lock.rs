//! Distributed mutual exclusion over the shared store.
//!
//! A lock is a key holding its owner's token with a TTL. Acquire sets the key
//! only if absent; release deletes it only if the caller's token still
//! matches, so an owner whose TTL lapsed cannot release someone else's lock.
//! Store failures read as "not acquired" / "not released".

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatekeeperError, Result};
use crate::store::{AtomicScript, ScriptArg, ScriptStore};

/// Lock timing and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Time-to-live of an acquired lock
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Attempts made by `acquire_with_retry`
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl LockConfig {
    /// Lock TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(GatekeeperError::Config("lock.ttl_ms must be positive".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(GatekeeperError::Config(
                "lock.retry_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate a fresh, unguessable owner token.
pub fn new_owner_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Distributed lock backed by a [`ScriptStore`].
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: Arc<dyn ScriptStore>,
    key_prefix: String,
    config: LockConfig,
    request_timeout: Duration,
}

impl DistributedLock {
    /// Create a lock client.
    pub fn new(
        store: Arc<dyn ScriptStore>,
        key_prefix: impl Into<String>,
        config: LockConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            config,
            request_timeout,
        }
    }

    /// The lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, key)
    }

    async fn eval(&self, script: AtomicScript, key: &str, args: &[ScriptArg]) -> Result<i64> {
        let keys = [self.lock_key(key)];
        match tokio::time::timeout(self.request_timeout, self.store.eval(script, &keys, args)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(GatekeeperError::Timeout(self.request_timeout)),
        }
    }

    /// Try once to take `key` for `owner_token` for `ttl`. Never blocks on
    /// contention.
    pub async fn acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> bool {
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let args = [ScriptArg::from(owner_token), ScriptArg::from(ttl_ms)];
        match self.eval(AtomicScript::LockAcquire, key, &args).await {
            Ok(1) => {
                debug!(lock = %key, ttl_ms = ttl_ms, "Lock acquired");
                true
            }
            Ok(_) => {
                debug!(lock = %key, "Lock held by another owner");
                false
            }
            Err(err) => {
                warn!(lock = %key, error = %err, "Lock acquire failed");
                false
            }
        }
    }

    /// Release `key` if `owner_token` still holds it.
    pub async fn release(&self, key: &str, owner_token: &str) -> bool {
        let args = [ScriptArg::from(owner_token)];
        match self.eval(AtomicScript::LockRelease, key, &args).await {
            Ok(1) => {
                debug!(lock = %key, "Lock released");
                true
            }
            Ok(_) => {
                debug!(lock = %key, "Lock not held by caller");
                false
            }
            Err(err) => {
                warn!(lock = %key, error = %err, "Lock release failed");
                false
            }
        }
    }

    /// Try up to `retry_attempts` times with the configured TTL, sleeping
    /// `retry_delay` between attempts.
    pub async fn acquire_with_retry(&self, key: &str, owner_token: &str) -> bool {
        for attempt in 1..=self.config.retry_attempts {
            if self.acquire(key, owner_token, self.config.ttl()).await {
                return true;
            }
            if attempt < self.config.retry_attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }
        debug!(lock = %key, attempts = self.config.retry_attempts, "Gave up acquiring lock");
        false
    }

    /// Run `task` while holding `key`.
    ///
    /// Returns `None` without running `task` if the lock could not be taken.
    pub async fn run_exclusive<T, F, Fut>(&self, key: &str, task: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = new_owner_token();
        if !self.acquire_with_retry(key, &token).await {
            return None;
        }
        let output = task().await;
        if !self.release(key, &token).await {
            warn!(lock = %key, "Lock expired before the task finished");
        }
        Some(output)
    }
}
