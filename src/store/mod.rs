//! Shared store capability.
//!
//! The centralized limiter and the distributed lock need a key/value store
//! with per-key expiry, an ordered set with range-by-score and cardinality,
//! and server-side atomic scripts that take keys plus arguments and return an
//! integer. [`ScriptStore`] is that contract; [`RedisStore`] implements it with
//! Lua scripts and [`MemoryStore`] implements it in-process.

mod memory;
mod redis_store;
pub mod testing;

use std::fmt;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
use crate::error::StoreError;

/// The catalog of atomic scripts the store must provide.
///
/// Admission scripts return the post-admission count (`> 0`) when the attempt
/// is admitted and `-retry_after_millis` (`< 0`) when it is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicScript {
    /// `KEYS[1]` bucket key; `ARGV` limit, ttl ms, ms until bucket end.
    FixedWindowAdmit,
    /// `KEYS[1]` set key; `ARGV` limit, window ms, now ms, member id.
    SlidingWindowAdmit,
    /// `KEYS[1]` lock key; `ARGV` owner token, ttl ms. Returns 1 if acquired.
    LockAcquire,
    /// `KEYS[1]` lock key; `ARGV` owner token. Returns 1 if released.
    LockRelease,
}

impl AtomicScript {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            AtomicScript::FixedWindowAdmit => "fixed_window_admit",
            AtomicScript::SlidingWindowAdmit => "sliding_window_admit",
            AtomicScript::LockAcquire => "lock_acquire",
            AtomicScript::LockRelease => "lock_release",
        }
    }
}

impl fmt::Display for AtomicScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A script argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Int(i64),
    Str(String),
}

impl ScriptArg {
    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            ScriptArg::Int(v) => Some(*v),
            ScriptArg::Str(s) => s.parse().ok(),
        }
    }

    pub(crate) fn as_str(&self) -> String {
        match self {
            ScriptArg::Int(v) => v.to_string(),
            ScriptArg::Str(s) => s.clone(),
        }
    }
}

impl From<i64> for ScriptArg {
    fn from(v: i64) -> Self {
        ScriptArg::Int(v)
    }
}

impl From<u64> for ScriptArg {
    fn from(v: u64) -> Self {
        ScriptArg::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for ScriptArg {
    fn from(v: &str) -> Self {
        ScriptArg::Str(v.to_string())
    }
}

impl From<String> for ScriptArg {
    fn from(v: String) -> Self {
        ScriptArg::Str(v)
    }
}

/// A store able to run the [`AtomicScript`] catalog.
#[async_trait]
pub trait ScriptStore: Send + Sync + fmt::Debug {
    /// Run `script` atomically against `keys` with `args`.
    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError>;

    /// Read an integer counter; missing or non-numeric values read as zero.
    async fn read_count(&self, key: &str) -> Result<u64, StoreError>;

    /// Count ordered-set members scored strictly above `min_score`.
    async fn count_since(&self, key: &str, min_score: u64) -> Result<u64, StoreError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
