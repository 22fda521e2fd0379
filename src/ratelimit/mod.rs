//! Rate limiting strategies and the types they share.

mod backend;
mod centralized;
mod counter;
mod key;
mod local;
mod policy;

pub use backend::{Decision, Limiter};
pub use centralized::CentralizedLimiter;
pub use counter::WindowCounter;
pub use key::{RateLimitKey, SCOPE_BY_IP, SCOPE_BY_USER};
pub use local::InProcessLimiter;
pub use policy::{Algorithm, LimitPolicy, PolicyTable};
