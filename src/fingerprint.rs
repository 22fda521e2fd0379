//! Caller fingerprinting.
//!
//! A fingerprint is the lowercase hex SHA-256 of `ip + "|" + user_agent`,
//! where the IP is resolved through proxy headers in a fixed precedence order.
//! The raw IP and user-agent never leave this module.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use sha2::{Digest, Sha256};
use tracing::trace;

/// Sentinel used when no usable IP or user-agent is present.
pub const UNKNOWN: &str = "unknown";

/// Header carrying the proxy chain; only its first hop is used.
const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by a single trusted reverse proxy.
const REAL_IP: &str = "x-real-ip";
/// Less common forwarding headers, tried in this order after the two above.
const GENERIC_FORWARDED: [&str; 5] = [
    "forwarded",
    "proxy-client-ip",
    "wl-proxy-client-ip",
    "http-client-ip",
    "http-x-forwarded-for",
];
const USER_AGENT: &str = "user-agent";

/// The identity-bearing attributes of an inbound request.
///
/// Header names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    headers: HashMap<String, String>,
    peer_addr: Option<String>,
}

impl RequestIdentity {
    /// Create an identity from the transport-layer peer address.
    pub fn new(peer_addr: Option<impl Into<String>>) -> Self {
        Self {
            headers: HashMap::new(),
            peer_addr: peer_addr.map(Into::into),
        }
    }

    /// Attach a request header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Resolve the real client IP, or [`UNKNOWN`] if no candidate validates.
    pub fn client_ip(&self) -> String {
        let forwarded_for = self
            .header(FORWARDED_FOR)
            .and_then(|v| v.split(',').next());
        let real_ip = self.header(REAL_IP);
        let generic = GENERIC_FORWARDED.iter().map(|name| {
            self.header(name).and_then(|v| {
                if *name == "forwarded" {
                    forwarded_for_param(v)
                } else {
                    v.split(',').next()
                }
            })
        });

        std::iter::once(forwarded_for)
            .chain(std::iter::once(real_ip))
            .chain(generic)
            .chain(std::iter::once(self.peer_addr.as_deref()))
            .flatten()
            .map(str::trim)
            .find(|candidate| is_usable_ip(candidate))
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// The trimmed user-agent, or [`UNKNOWN`] if missing or blank.
    pub fn user_agent(&self) -> String {
        match self.header(USER_AGENT).map(str::trim) {
            Some(ua) if !ua.is_empty() => ua.to_string(),
            _ => UNKNOWN.to_string(),
        }
    }
}

/// Extract the `for=` parameter of the first element of an RFC 7239 header.
fn forwarded_for_param(value: &str) -> Option<&str> {
    let first = value.split(',').next()?;
    first.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k.trim().eq_ignore_ascii_case("for") {
            Some(v.trim().trim_matches('"').trim_start_matches('[').trim_end_matches(']'))
        } else {
            None
        }
    })
}

fn is_usable_ip(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.eq_ignore_ascii_case(UNKNOWN) {
        return false;
    }
    match candidate.parse::<IpAddr>() {
        Ok(ip) => !ip.is_loopback(),
        Err(_) => candidate != "localhost",
    }
}

/// A 64-character lowercase hex SHA-256 digest identifying a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash already-resolved inputs.
    pub fn from_parts(ip: &str, user_agent: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ip.as_bytes());
        hasher.update(b"|");
        hasher.update(user_agent.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the fingerprint for a request.
pub fn derive(identity: &RequestIdentity) -> Fingerprint {
    let ip = identity.client_ip();
    let user_agent = identity.user_agent();
    let fingerprint = Fingerprint::from_parts(&ip, &user_agent);
    trace!(fingerprint = %fingerprint, "Derived caller fingerprint");
    fingerprint
}
