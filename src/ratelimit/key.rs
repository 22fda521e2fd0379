//! Rate limit key construction.

use std::fmt;

use crate::fingerprint::Fingerprint;

/// Scope tag for buckets keyed by caller fingerprint.
pub const SCOPE_BY_IP: &str = "by-ip";
/// Scope tag for buckets keyed by authenticated user id.
pub const SCOPE_BY_USER: &str = "by-user";

/// A key that uniquely identifies one admission bucket.
///
/// The key is composed of a scope prefix, an identity token and an action
/// tag, rendered as `scope:identity:action`. Fields are private so a key
/// cannot change once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    scope: String,
    identity: String,
    action: String,
}

impl RateLimitKey {
    /// Create a new key from its three parts.
    pub fn new(scope: impl Into<String>, identity: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identity: identity.into(),
            action: action.into(),
        }
    }

    /// Key a fingerprinted anonymous caller.
    pub fn by_ip(fingerprint: &Fingerprint, action: impl Into<String>) -> Self {
        Self::new(SCOPE_BY_IP, fingerprint.as_str(), action)
    }

    /// Key an authenticated user.
    pub fn by_user(user_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(SCOPE_BY_USER, user_id, action)
    }

    /// The scope prefix.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The identity token.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The action tag.
    pub fn action(&self) -> &str {
        &self.action
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scope, self.identity, self.action)
    }
}
