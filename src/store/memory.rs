//! In-process implementation of the shared store contract.
//!
//! Each script runs under a single mutex, which gives the same atomicity the
//! Redis scripts get from the server. Entries past their deadline are dropped
//! when touched, and a full purge runs at most once per `PURGE_INTERVAL_MS`
//! from inside store calls, so buckets that are never touched again do not
//! accumulate. Useful for single-node deployments and for exercising the
//! centralized code paths without a Redis server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::{AtomicScript, ScriptArg, ScriptStore};
use crate::clock::{SharedClock, SystemClock};
use crate::error::StoreError;

/// Minimum time between full purges of expired entries.
const PURGE_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// (score, member), kept sorted by score
    Sorted(Vec<(u64, String)>),
}

#[derive(Debug, Clone)]
struct Item {
    value: Value,
    expires_at: Option<u64>,
}

/// Shared store held in process memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Item>>>,
    next_purge_at: Arc<AtomicU64>,
    clock: SharedClock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store using `clock` for expiry.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            next_purge_at: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Lock the map, purging expired entries first if a purge is due.
    fn lock_at(&self, now: u64) -> MutexGuard<'_, HashMap<String, Item>> {
        let mut data = self.data.lock();
        if now >= self.next_purge_at.load(Ordering::Relaxed) {
            self.next_purge_at.store(now + PURGE_INTERVAL_MS, Ordering::Relaxed);
            let purged = purge(&mut data, now);
            if purged > 0 {
                debug!(purged = purged, remaining = data.len(), "Purged expired store entries");
            }
        }
        data
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        purge(&mut self.data.lock(), now)
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn raw_len(&self) -> usize {
        self.data.lock().len()
    }

    /// Store a raw string value without expiry, overwriting anything there.
    pub fn set_raw(&self, key: &str, value: &str) {
        self.data.lock().insert(
            key.to_string(),
            Item {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
    }

    /// Read a raw string value.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        match live(&mut data, key, now) {
            Some(Item {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let data = self.data.lock();
        data.values()
            .filter(|item| item.expires_at.map_or(true, |at| at > now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fixed_window_admit(&self, key: &str, args: &[ScriptArg]) -> Result<i64, StoreError> {
        let limit = int_arg(args, 0)?;
        let ttl = int_arg(args, 1)?.max(1) as u64;
        let retry = int_arg(args, 2)?;
        let now = self.clock.now_millis();

        let mut data = self.lock_at(now);
        let current = match live(&mut data, key, now) {
            Some(Item {
                value: Value::Str(s),
                ..
            }) => s.trim().parse::<i64>().unwrap_or(0),
            _ => 0,
        };

        if current < limit {
            let next = current + 1;
            data.insert(
                key.to_string(),
                Item {
                    value: Value::Str(next.to_string()),
                    expires_at: Some(now + ttl),
                },
            );
            Ok(next)
        } else {
            Ok(-retry.max(1))
        }
    }

    fn sliding_window_admit(&self, key: &str, args: &[ScriptArg]) -> Result<i64, StoreError> {
        let limit = int_arg(args, 0)?;
        let window = int_arg(args, 1)?.max(1) as u64;
        let now = int_arg(args, 2)?.max(0) as u64;
        let member = args
            .get(3)
            .map(ScriptArg::as_str)
            .ok_or_else(|| StoreError::Script("missing member argument".to_string()))?;
        let clock_now = self.clock.now_millis();

        let mut data = self.lock_at(clock_now);
        let mut entries = match live(&mut data, key, clock_now) {
            Some(Item {
                value: Value::Sorted(entries),
                ..
            }) => std::mem::take(entries),
            Some(_) => {
                return Err(StoreError::Script(format!(
                    "WRONGTYPE key {key} does not hold a sorted set"
                )))
            }
            None => Vec::new(),
        };

        let cutoff = now as i64 - window as i64;
        entries.retain(|(score, _)| *score as i64 > cutoff);
        let current = entries.len() as i64;

        let reply = if current < limit {
            entries.retain(|(_, m)| *m != member);
            let at = entries.partition_point(|(score, _)| *score <= now);
            entries.insert(at, (now, member));
            current + 1
        } else {
            let retry = entries
                .first()
                .map(|(oldest, _)| (oldest + window).saturating_sub(now))
                .unwrap_or(window);
            -(retry.max(1) as i64)
        };

        // An admission refreshes the TTL; a denial leaves it as it was.
        let expires_at = if reply > 0 {
            Some(clock_now + window)
        } else {
            data.get(key).and_then(|item| item.expires_at)
        };
        if entries.is_empty() {
            data.remove(key);
        } else {
            data.insert(
                key.to_string(),
                Item {
                    value: Value::Sorted(entries),
                    expires_at,
                },
            );
        }
        Ok(reply)
    }

    fn lock_acquire(&self, key: &str, args: &[ScriptArg]) -> Result<i64, StoreError> {
        let token = str_arg(args, 0)?;
        let ttl = int_arg(args, 1)?.max(1) as u64;
        let now = self.clock.now_millis();

        let mut data = self.lock_at(now);
        if live(&mut data, key, now).is_some() {
            return Ok(0);
        }
        data.insert(
            key.to_string(),
            Item {
                value: Value::Str(token),
                expires_at: Some(now + ttl),
            },
        );
        Ok(1)
    }

    fn lock_release(&self, key: &str, args: &[ScriptArg]) -> Result<i64, StoreError> {
        let token = str_arg(args, 0)?;
        let now = self.clock.now_millis();

        let mut data = self.data.lock();
        let owned = matches!(
            live(&mut data, key, now),
            Some(Item { value: Value::Str(s), .. }) if *s == token
        );
        if owned {
            data.remove(key);
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

fn purge(data: &mut HashMap<String, Item>, now: u64) -> usize {
    let before = data.len();
    data.retain(|_, item| item.expires_at.map_or(true, |at| at > now));
    before - data.len()
}

/// Look up a key, dropping it first if it has expired.
fn live<'a>(data: &'a mut HashMap<String, Item>, key: &str, now: u64) -> Option<&'a mut Item> {
    let expired = data
        .get(key)
        .and_then(|item| item.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        data.remove(key);
    }
    data.get_mut(key)
}

fn int_arg(args: &[ScriptArg], index: usize) -> Result<i64, StoreError> {
    args.get(index)
        .and_then(ScriptArg::as_int)
        .ok_or_else(|| StoreError::Script(format!("argument {index} is not an integer")))
}

fn str_arg(args: &[ScriptArg], index: usize) -> Result<String, StoreError> {
    args.get(index)
        .map(ScriptArg::as_str)
        .ok_or_else(|| StoreError::Script(format!("missing argument {index}")))
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError> {
        let key = keys
            .first()
            .ok_or_else(|| StoreError::Script(format!("{script}: missing key")))?;
        match script {
            AtomicScript::FixedWindowAdmit => self.fixed_window_admit(key, args),
            AtomicScript::SlidingWindowAdmit => self.sliding_window_admit(key, args),
            AtomicScript::LockAcquire => self.lock_acquire(key, args),
            AtomicScript::LockRelease => self.lock_release(key, args),
        }
    }

    async fn read_count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .get_raw(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn count_since(&self, key: &str, min_score: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut data = self.data.lock();
        Ok(match live(&mut data, key, now) {
            Some(Item {
                value: Value::Sorted(entries),
                ..
            }) => entries.iter().filter(|(score, _)| *score > min_score).count() as u64,
            _ => 0,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }
}
