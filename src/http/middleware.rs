//! Rate limit enforcement middleware.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CONTENT_TYPE, RETRY_AFTER},
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::trace;

use super::identity::{request_identity, IdentitySettings};
use crate::ratelimit::{Decision, LimiterRegistry, RateLimiter};

/// Header carrying the limit of the window.
pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
/// Header carrying the requests left in the window.
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");

/// State for [`enforce_rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    pub registry: Arc<LimiterRegistry>,
    pub identity: Arc<IdentitySettings>,
}

impl RateLimitState {
    pub fn new(registry: Arc<LimiterRegistry>, identity: IdentitySettings) -> Self {
        Self {
            registry,
            identity: Arc::new(identity),
        }
    }

    /// State applying one limiter to every request it sees, for attaching a
    /// limiter to a single route.
    pub fn single(limiter: Arc<RateLimiter>, identity: IdentitySettings) -> Self {
        Self::new(Arc::new(LimiterRegistry::single(limiter)), identity)
    }
}

/// Middleware admitting or rejecting requests by identity.
///
/// The resolved [`crate::ratelimit::IdentityKey`] is added to the request
/// extensions for downstream handlers. Rejected requests never reach the
/// rest of the chain.
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let limiter = state
        .registry
        .select(request.uri().path(), request.method().as_str())
        .clone();
    let key = request_identity(&request, &state.identity).key();

    let decision = limiter.check(&key).await;
    trace!(limiter = %limiter.name(), key = %key, decision = ?decision, "Rate limit decision made");

    if !decision.is_allowed() {
        return rejection(&limiter, decision);
    }

    request.extensions_mut().insert(key);
    let mut response = next.run(request).await;
    if let Decision::Allow { limit, .. } = decision {
        insert_quota_headers(response.headers_mut(), limit, decision.remaining().unwrap_or(0));
    }
    response
}

fn insert_quota_headers(headers: &mut HeaderMap, limit: u64, remaining: u64) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(remaining));
}

/// The response for a request the limiter did not admit.
pub fn rejection(limiter: &RateLimiter, decision: Decision) -> Response {
    match decision {
        Decision::Deny { limit, .. } => {
            let window_ms = limiter.options().window_ms;
            let retry_after = window_ms.div_ceil(1000);

            let mut response = match limiter.message() {
                // Plain strings go out as text, anything else as JSON.
                serde_json::Value::String(text) => (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                    text.clone(),
                )
                    .into_response(),
                body => (StatusCode::TOO_MANY_REQUESTS, Json(body.clone())).into_response(),
            };

            let headers = response.headers_mut();
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
            insert_quota_headers(headers, limit, 0);
            response
        }
        Decision::Unidentified => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Unable to identify requester" })),
        )
            .into_response(),
        Decision::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Rate limiting unavailable, try again later" })),
        )
            .into_response(),
        // Admitted decisions never get here; answer as a pass-through would.
        Decision::Allow { .. } | Decision::Degraded => StatusCode::OK.into_response(),
    }
}
