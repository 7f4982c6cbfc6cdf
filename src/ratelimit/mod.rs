//! Rate limiting logic and state management.

mod backend;
mod identity;
mod limiter;
mod registry;
mod rules;
mod store;

pub use backend::WindowBackend;
pub use identity::{IdentityKey, ParseIdentityKeyError, RequestIdentity};
pub use limiter::{Decision, FailureMode, RateLimitOptions, RateLimiter, DEFAULT_MAX, DEFAULT_WINDOW_MS};
pub use registry::{LimiterRegistry, DEFAULT_LIMITER};
pub use rules::{RouteRule, RouteRules};
pub use store::{Sweeper, WindowStore};
