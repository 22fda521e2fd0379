//! Wiring of the subsystem from a [`GatekeeperConfig`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::GatekeeperConfig;
use crate::error::Result;
use crate::fingerprint::{self, RequestIdentity};
use crate::lock::DistributedLock;
use crate::ratelimit::{CentralizedLimiter, Decision, InProcessLimiter, RateLimitKey};
use crate::resilience::{CircuitBreaker, ResilientLimiter};
use crate::store::{MemoryStore, RedisStore, ScriptStore};

/// The assembled subsystem: a breaker-guarded centralized limiter with an
/// in-process fallback, plus a lock client on the same store.
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    limiter: ResilientLimiter<CentralizedLimiter>,
    lock: DistributedLock,
    config: Arc<GatekeeperConfig>,
}

impl Gatekeeper {
    /// Connect to the configured store and assemble the subsystem.
    ///
    /// Without `store.url` the counters live in an in-process store, which
    /// is only shared within this process. An unreachable Redis server is
    /// not fatal: decisions fall back to in-process limiting until it comes
    /// up. Only an invalid URL is an error.
    pub async fn connect(config: GatekeeperConfig) -> Result<Self> {
        let store: Arc<dyn ScriptStore> = match config.store.url.as_deref() {
            Some(url) => {
                let store = RedisStore::connect_lazy(url)?;
                let warm_up = tokio::time::timeout(config.store.request_timeout(), store.ensure_connected());
                match warm_up.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(error = %err, "Redis unavailable at startup, using fallback until it recovers"),
                    Err(_) => warn!("Redis connection timed out at startup, using fallback until it recovers"),
                }
                Arc::new(store)
            }
            None => {
                info!("No store URL configured, using in-process store");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store, Arc::new(SystemClock::new())))
    }

    /// Assemble the subsystem over an existing store and clock.
    pub fn with_store(config: GatekeeperConfig, store: Arc<dyn ScriptStore>, clock: SharedClock) -> Self {
        let timeout = config.store.request_timeout();
        let policies = config.limits.policies.clone();

        let primary = CentralizedLimiter::with_clock(
            Arc::clone(&store),
            config.store.key_prefix.clone(),
            policies.clone(),
            Arc::clone(&clock),
        );
        let fallback = InProcessLimiter::with_clock(policies, Arc::clone(&clock));
        let breaker = CircuitBreaker::with_clock(config.breaker.clone(), clock);
        let limiter = ResilientLimiter::new(Arc::new(primary), Arc::new(fallback), Arc::new(breaker), timeout);

        let lock = DistributedLock::new(store, config.store.key_prefix.clone(), config.lock.clone(), timeout);

        Self {
            limiter,
            lock,
            config: Arc::new(config),
        }
    }

    /// The configuration this instance was built from.
    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    /// The guarded limiter.
    pub fn limiter(&self) -> &ResilientLimiter<CentralizedLimiter> {
        &self.limiter
    }

    /// The lock client.
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Fingerprint an anonymous request and check it against the `by-ip`
    /// policy for `action`.
    pub async fn check_request(&self, identity: &RequestIdentity, action: &str) -> Decision {
        let key = RateLimitKey::by_ip(&fingerprint::derive(identity), action);
        let policy = self.limiter.policies().for_key(&key);
        self.limiter.decide(&key, &policy).await
    }

    /// Check an authenticated user against the `by-user` policy for `action`.
    pub async fn check_user(&self, user_id: &str, action: &str) -> Decision {
        let key = RateLimitKey::by_user(user_id, action);
        let policy = self.limiter.policies().for_key(&key);
        self.limiter.decide(&key, &policy).await
    }

    /// Start the periodic sweep of fallback counters.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.limiter
            .spawn_fallback_sweeper(self.config.limits.cleanup_interval())
    }
}
