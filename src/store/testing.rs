//! Fault injection for exercising store failure paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AtomicScript, ScriptArg, ScriptStore};
use crate::error::StoreError;

/// Wraps a store and can be switched to fail or stall on demand.
///
/// Clones share the same switches and counters.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: Arc<dyn ScriptStore>,
    failing: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<AtomicU64>,
}

impl FlakyStore {
    /// Wrap `inner`; starts healthy.
    pub fn new(inner: Arc<dyn ScriptStore>) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
            delay: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every call fail with a connection error (or stop doing so).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sleep for `delay` before every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of calls that reached this store, failed or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused (injected)".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptStore for FlakyStore {
    async fn eval(
        &self,
        script: AtomicScript,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<i64, StoreError> {
        self.enter().await?;
        self.inner.eval(script, keys, args).await
    }

    async fn read_count(&self, key: &str) -> Result<u64, StoreError> {
        self.enter().await?;
        self.inner.read_count(key).await
    }

    async fn count_since(&self, key: &str, min_score: u64) -> Result<u64, StoreError> {
        self.enter().await?;
        self.inner.count_since(key, min_score).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.inner.delete(key).await
    }
}
