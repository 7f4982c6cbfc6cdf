//! HTTP surface: bearer decoding, rate limit middleware and the server.

mod auth;
mod identity;
mod middleware;
mod routes;
mod server;

pub use auth::{
    bearer_token, resolve_bearer_user, AuthUser, RequestUser, TokenClaims, TokenVerifier,
    UserIdClaim,
};
pub use identity::{request_identity, IdentitySettings};
pub use middleware::{
    enforce_rate_limit, rejection, RateLimitState, RATELIMIT_LIMIT, RATELIMIT_REMAINING,
};
pub use routes::{router, AppState};
pub use server::HttpServer;
