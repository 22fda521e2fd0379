//! Redis-backed shared store.
//!
//! Every multi-step operation runs as a Lua script so concurrent callers on
//! any instance are serialized by Redis itself. Scripts are loaded lazily:
//! `Script::invoke_async` sends `EVALSHA` and falls back to `EVAL` on a
//! cache miss.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{AtomicScript, ScriptArg, ScriptStore};
use crate::error::StoreError;

/// Reconnect attempts made per call while the server is unreachable.
const CONNECT_RETRIES: usize = 1;

/// Admit if the bucket count is below the limit, refreshing the TTL.
///
/// A non-numeric stored count reads as zero.
const FIXED_WINDOW_ADMIT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local ttl_ms = tonumber(ARGV[2])
local retry_ms = tonumber(ARGV[3])

local current = tonumber(redis.call('GET', key)) or 0
if current < limit then
    current = current + 1
    redis.call('SET', key, current, 'PX', ttl_ms)
    return current
end

if retry_ms < 1 then
    retry_ms = 1
end
return -retry_ms
"#;

/// Purge expired members, then admit if the remaining cardinality is below
/// the limit. A denial reports when the oldest member leaves the window.
const SLIDING_WINDOW_ADMIT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local current = redis.call('ZCARD', key)

if current < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window_ms)
    return current + 1
end

local retry_ms = window_ms
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest >= 2 then
    local score = tonumber(oldest[2])
    if score then
        retry_ms = score + window_ms - now
    end
end
if retry_ms < 1 then
    retry_ms = 1
end
return -retry_ms
"#;

const LOCK_ACQUIRE: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', tonumber(ARGV[2])) then
    return 1
end
return 0
"#;

/// Delete the lock only if it is still held by the caller's token.
const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

struct Scripts {
    fixed_window: Script,
    sliding_window: Script,
    lock_acquire: Script,
    lock_release: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            fixed_window: Script::new(FIXED_WINDOW_ADMIT),
            sliding_window: Script::new(SLIDING_WINDOW_ADMIT),
            lock_acquire: Script::new(LOCK_ACQUIRE),
            lock_release: Script::new(LOCK_RELEASE),
        }
    }

    fn get(&self, script: AtomicScript) -> &Script {
        match script {
            AtomicScript::FixedWindowAdmit => &self.fixed_window,
            AtomicScript::SlidingWindowAdmit => &self.sliding_window,
            AtomicScript::LockAcquire => &self.lock_acquire,
            AtomicScript::LockRelease => &self.lock_release,
        }
    }
}

/// Shared store backed by Redis.
///
/// The connection is established on first use when built with
/// [`RedisStore::connect_lazy`]; until then every call fails with a
/// connection error, which the circuit breaker treats like any other outage.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    scripts: Arc<Scripts>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let store = Self::connect_lazy(url)?;
        store.ensure_connected().await?;
        Ok(store)
    }

    /// Build a store that connects on first use and retries on later calls
    /// until a connection is made.
    ///
    /// # Errors
    /// Returns error only if the URL is invalid.
    pub fn connect_lazy(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: Arc::new(OnceCell::new()),
            scripts: Arc::new(Scripts::new()),
        })
    }

    /// Establish the connection now if it has not been made yet.
    pub async fn ensure_connected(&self) -> Result<(), StoreError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new().set_number_of_retries(CONNECT_RETRIES);
                let conn = ConnectionManager::new_with_config(self.client.clone(), config).await?;
                info!(addr = %self.client.get_connection_info().addr, "Connected to Redis");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.get(script).prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            match arg {
                ScriptArg::Int(v) => invocation.arg(*v),
                ScriptArg::Str(s) => invocation.arg(s.as_str()),
            };
        }

        let reply: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(script = %script, keys = ?keys, reply = reply, "Evaluated store script");
        Ok(reply)
    }

    async fn read_count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
    }

    async fn count_since(&self, key: &str, min_score: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(format!("({min_score}"))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
