//! Circuit breaker over a rolling window of call outcomes.
//!
//! `Closed` records the last `sliding_window_size` outcomes and opens once at
//! least `minimum_calls` have been seen and the failure rate is above the
//! threshold. `Open` rejects every call until `wait_duration` has passed, then
//! moves to `HalfOpen`, which hands out exactly `half_open_trials` permits.
//! All trials succeeding closes the circuit with a fresh window; any trial
//! failing reopens it and restarts the wait.
//!
//! Each permit remembers the generation (transition count) it was issued in,
//! so outcomes that arrive after the state has moved on are ignored. A trial
//! permit dropped without an outcome reopens the circuit.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::error::{GatekeeperError, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow to the protected dependency
    Closed,
    /// Calls are rejected without touching the dependency
    Open,
    /// A bounded number of trial calls are let through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure rate (percent) above which the circuit opens
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// Outcomes required before the failure rate is evaluated
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,
    /// Number of most recent outcomes kept
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,
    /// How long the circuit stays open before trial calls are allowed
    #[serde(default = "default_wait_duration_ms")]
    pub wait_duration_ms: u64,
    /// Trial calls permitted while half-open
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_calls: default_minimum_calls(),
            sliding_window_size: default_sliding_window_size(),
            wait_duration_ms: default_wait_duration_ms(),
            half_open_trials: default_half_open_trials(),
        }
    }
}

fn default_failure_rate_threshold() -> f64 {
    50.0
}

fn default_minimum_calls() -> usize {
    10
}

fn default_sliding_window_size() -> usize {
    20
}

fn default_wait_duration_ms() -> u64 {
    30_000
}

fn default_half_open_trials() -> u32 {
    3
}

impl BreakerConfig {
    /// The open-state wait as a duration.
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(GatekeeperError::Config(
                "breaker.failure_rate_threshold must be in (0, 100]".to_string(),
            ));
        }
        if self.minimum_calls == 0 || self.sliding_window_size == 0 {
            return Err(GatekeeperError::Config(
                "breaker.minimum_calls and breaker.sliding_window_size must be positive".to_string(),
            ));
        }
        if self.minimum_calls > self.sliding_window_size {
            return Err(GatekeeperError::Config(
                "breaker.minimum_calls cannot exceed breaker.sliding_window_size".to_string(),
            ));
        }
        if self.half_open_trials == 0 {
            return Err(GatekeeperError::Config(
                "breaker.half_open_trials must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Observable breaker events.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    /// The circuit moved between states
    StateChanged {
        from: CircuitState,
        to: CircuitState,
    },
    /// The failure rate crossed the threshold while closed
    ThresholdBreached { failure_rate: f64 },
    /// A call was rejected without reaching the dependency
    CallNotPermitted { state: CircuitState },
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub failure_rate: f64,
}

/// Permission to make one call through the breaker.
///
/// A permit dropped without an outcome (the call was cancelled) counts as a
/// failed trial while half-open and is otherwise forgotten.
#[derive(Debug)]
#[must_use = "report the outcome with on_success or on_error"]
pub struct Permit {
    generation: u64,
    core: Weak<Core>,
    reported: bool,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.abandoned(self.generation);
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    /// `true` for failure, most recent last
    outcomes: VecDeque<bool>,
    opened_at: u64,
    trials_issued: u32,
    trials_succeeded: u32,
}

impl Inner {
    fn failure_counts(&self) -> (usize, usize) {
        let failed = self.outcomes.iter().filter(|failed| **failed).count();
        (self.outcomes.len(), failed)
    }
}

struct Core {
    inner: Mutex<Inner>,
    config: BreakerConfig,
    clock: SharedClock,
    events: broadcast::Sender<BreakerEvent>,
}

impl Core {
    fn succeeded(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            return;
        }

        match inner.state {
            CircuitState::Closed => self.record(&mut inner, false),
            CircuitState::HalfOpen => {
                inner.trials_succeeded += 1;
                if inner.trials_succeeded >= self.config.half_open_trials {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn failed(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            return;
        }

        match inner.state {
            CircuitState::Closed => self.record(&mut inner, true),
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn abandoned(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation == inner.generation && inner.state == CircuitState::HalfOpen {
            warn!("Half-open trial dropped without an outcome, reopening circuit");
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn record(&self, inner: &mut Inner, failed: bool) {
        if inner.outcomes.len() == self.config.sliding_window_size {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(failed);

        let (buffered, failures) = inner.failure_counts();
        if buffered < self.config.minimum_calls {
            return;
        }
        let failure_rate = rate(failures, buffered);
        if failure_rate > self.config.failure_rate_threshold {
            warn!(
                failure_rate = failure_rate,
                threshold = self.config.failure_rate_threshold,
                buffered_calls = buffered,
                "Circuit breaker failure threshold breached"
            );
            self.emit(BreakerEvent::ThresholdBreached { failure_rate });
            self.transition(inner, CircuitState::Open);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.trials_issued = 0;
        inner.trials_succeeded = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = self.clock.now_millis();
                warn!(from = %from, to = %to, wait_ms = self.config.wait_duration_ms, "Circuit breaker opened");
            }
            CircuitState::Closed => {
                inner.outcomes.clear();
                info!(from = %from, to = %to, "Circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                info!(from = %from, to = %to, trials = self.config.half_open_trials, "Circuit breaker half-open");
            }
        }
        self.emit(BreakerEvent::StateChanged { from, to });
    }

    fn emit(&self, event: BreakerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Rolling-window circuit breaker.
///
/// Thread-safe; share it behind an `Arc`.
pub struct CircuitBreaker {
    core: Arc<Core>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.core.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(config: BreakerConfig, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(64);
        let core = Core {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                outcomes: VecDeque::with_capacity(config.sliding_window_size),
                opened_at: 0,
                trials_issued: 0,
                trials_succeeded: 0,
            }),
            config,
            clock,
            events,
        };
        Self { core: Arc::new(core) }
    }

    /// The breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.core.config
    }

    /// Subscribe to breaker events.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.core.events.subscribe()
    }

    /// Get the current circuit state.
    ///
    /// An open circuit whose wait has elapsed still reports `Open` until the
    /// next call attempt moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.core.inner.lock().state
    }

    /// Snapshot of the rolling window.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.core.inner.lock();
        let (buffered, failed) = inner.failure_counts();
        BreakerMetrics {
            state: inner.state,
            buffered_calls: buffered,
            failed_calls: failed,
            failure_rate: rate(failed, buffered),
        }
    }

    /// Ask for permission to call the protected dependency.
    ///
    /// Returns `None` when the call must not be attempted.
    pub fn try_acquire(&self) -> Option<Permit> {
        let core = &self.core;
        let mut inner = core.inner.lock();

        if inner.state == CircuitState::Open {
            let waited = core.clock.now_millis().saturating_sub(inner.opened_at);
            if waited >= core.config.wait_duration_ms {
                core.transition(&mut inner, CircuitState::HalfOpen);
            }
        }

        let permitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if inner.trials_issued < core.config.half_open_trials => {
                inner.trials_issued += 1;
                debug!(trial = inner.trials_issued, "Issuing half-open trial permit");
                true
            }
            state => {
                core.emit(BreakerEvent::CallNotPermitted { state });
                false
            }
        };

        permitted.then(|| Permit {
            generation: inner.generation,
            core: Arc::downgrade(core),
            reported: false,
        })
    }

    /// Record that a permitted call succeeded.
    pub fn on_success(&self, mut permit: Permit) {
        permit.reported = true;
        self.core.succeeded(permit.generation);
    }

    /// Record that a permitted call failed.
    pub fn on_error(&self, mut permit: Permit) {
        permit.reported = true;
        self.core.failed(permit.generation);
    }

    /// Force the breaker back to `Closed` with an empty window.
    pub fn reset(&self) {
        let mut inner = self.core.inner.lock();
        if inner.state != CircuitState::Closed {
            self.core.transition(&mut inner, CircuitState::Closed);
        } else {
            inner.outcomes.clear();
        }
    }
}

fn rate(failed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        failed as f64 * 100.0 / total as f64
    }
}

/// Shareable circuit breaker reference.
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;
