//! Gatekeeper - resilient admission control
//!
//! This crate decides whether a caller may perform an action. Anonymous
//! callers are identified by a fingerprint of their client address and user
//! agent; counters live in a shared store (Redis) and are updated with atomic
//! scripts using fixed or sliding windows. A circuit breaker guards the store
//! and reroutes calls to an in-process limiter while it is unhealthy. A
//! token-owned distributed lock is provided on the same store.

pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod gatekeeper;
pub mod lock;
pub mod ratelimit;
pub mod resilience;
pub mod store;

pub use gatekeeper::Gatekeeper;
