//! Admission policies and per-scope policy resolution.
//!
//! A policy is a limit, a window of arbitrary length and the algorithm used
//! to count admissions inside that window. Policies are looked up by the
//! key's scope tag; unknown scopes fall back to the `by-ip` policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::{RateLimitKey, SCOPE_BY_IP, SCOPE_BY_USER};
use crate::error::{GatekeeperError, Result};

/// Counting algorithm used by the centralized limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Wall-clock aligned buckets; up to `2 * limit - 1` across a boundary.
    #[default]
    FixedWindow,
    /// Trailing interval; never more than `limit` in any window.
    SlidingWindow,
}

impl std::str::FromStr for Algorithm {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed" | "fixed_window" => Ok(Algorithm::FixedWindow),
            "sliding" | "sliding_window" => Ok(Algorithm::SlidingWindow),
            other => Err(GatekeeperError::Config(format!("unknown algorithm: {other}"))),
        }
    }
}

/// A limit, a window and an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Maximum admissions per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Counting algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl LimitPolicy {
    /// Create a fixed-window policy.
    pub fn fixed(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_secs: window.as_secs().max(1),
            algorithm: Algorithm::FixedWindow,
        }
    }

    /// Create a sliding-window policy.
    pub fn sliding(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_secs: window.as_secs().max(1),
            algorithm: Algorithm::SlidingWindow,
        }
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The window in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    /// Reject a zero limit or window; `name` prefixes the error.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(GatekeeperError::Config(format!("{name}: limit must be positive")));
        }
        if self.window_secs == 0 {
            return Err(GatekeeperError::Config(format!("{name}: window_secs must be positive")));
        }
        Ok(())
    }
}

/// Policies indexed by scope tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Used when neither the key's scope nor `by-ip` is configured
    #[serde(default = "default_policy")]
    pub default: LimitPolicy,
    /// Scope tag -> policy
    #[serde(default = "default_scopes")]
    pub scopes: HashMap<String, LimitPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            default: default_policy(),
            scopes: default_scopes(),
        }
    }
}

fn default_policy() -> LimitPolicy {
    LimitPolicy::fixed(100, Duration::from_secs(3600))
}

fn default_scopes() -> HashMap<String, LimitPolicy> {
    HashMap::from([
        (
            SCOPE_BY_IP.to_string(),
            LimitPolicy::fixed(5, Duration::from_secs(3600)),
        ),
        (
            SCOPE_BY_USER.to_string(),
            LimitPolicy::fixed(20, Duration::from_secs(86_400)),
        ),
    ])
}

impl PolicyTable {
    /// Create a table with only a default policy and no scopes.
    pub fn with_default(default: LimitPolicy) -> Self {
        Self {
            default,
            scopes: HashMap::new(),
        }
    }

    /// Add or replace the policy for a scope.
    pub fn with_scope(mut self, scope: impl Into<String>, policy: LimitPolicy) -> Self {
        self.scopes.insert(scope.into(), policy);
        self
    }

    /// Resolve the policy for a scope tag.
    pub fn resolve(&self, scope: &str) -> LimitPolicy {
        self.scopes
            .get(scope)
            .or_else(|| self.scopes.get(SCOPE_BY_IP))
            .copied()
            .unwrap_or(self.default)
    }

    /// Resolve the policy for a key.
    pub fn for_key(&self, key: &RateLimitKey) -> LimitPolicy {
        self.resolve(key.scope())
    }

    /// The longest window of any configured policy.
    pub fn longest_window(&self) -> Duration {
        self.scopes
            .values()
            .chain(std::iter::once(&self.default))
            .map(LimitPolicy::window)
            .max()
            .unwrap_or_default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.default.validate("limits.default")?;
        for (scope, policy) in &self.scopes {
            policy.validate(&format!("limits.scopes.{scope}"))?;
        }
        Ok(())
    }
}
