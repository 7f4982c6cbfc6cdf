//! Router construction and endpoint handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::auth::{resolve_bearer_user, RequestUser, TokenVerifier};
use super::identity::IdentitySettings;
use super::middleware::{enforce_rate_limit, RateLimitState};
use crate::config::UserLimitConfig;
use crate::error::Result;
use crate::ratelimit::{IdentityKey, LimiterRegistry, RouteRules};

/// Everything the HTTP surface needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LimiterRegistry>,
    pub verifier: Option<Arc<TokenVerifier>>,
    pub identity: IdentitySettings,
    pub admin_enabled: bool,
}

impl AppState {
    /// Build limiters, rules and the token verifier from configuration.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_config(config: &UserLimitConfig) -> Result<Self> {
        let rules = match &config.rate_limiting.rules_path {
            Some(path) => RouteRules::from_file(path)?,
            None => RouteRules::new(),
        };
        let registry = LimiterRegistry::new(config.rate_limiting.limits.clone(), rules)?;

        let verifier = match &config.auth.jwt_secret {
            Some(secret) => Some(Arc::new(TokenVerifier::new(secret.as_bytes()))),
            None => {
                warn!("No auth.jwt_secret configured, bearer tokens will be ignored");
                None
            }
        };

        Ok(Self {
            registry: Arc::new(registry),
            verifier,
            identity: config.rate_limiting.identity.clone(),
            admin_enabled: config.server.admin_enabled,
        })
    }
}

/// Build the service router.
///
/// `/health` is never limited. Bearer decoding wraps every route, so the
/// limiter always sees the request user.
pub fn router(state: &AppState) -> Router {
    let limits = RateLimitState::new(state.registry.clone(), state.identity.clone());

    let limited = Router::new()
        .route("/whoami", get(whoami))
        .layer(from_fn_with_state(limits, enforce_rate_limit));

    let mut app = Router::new().route("/health", get(health)).merge(limited);

    if state.admin_enabled {
        info!("Admin endpoints enabled under /admin");
        app = app.nest("/admin", admin_router(state.registry.clone()));
    }

    app.layer(from_fn_with_state(state.verifier.clone(), resolve_bearer_user))
}

fn admin_router(registry: Arc<LimiterRegistry>) -> Router {
    Router::new()
        .route("/limits", get(list_limits))
        .route("/limits/{key}", delete(reset_limit))
        .with_state(registry)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Echo the identity the limiter used for this request.
async fn whoami(request: Request<Body>) -> Json<Value> {
    let extensions = request.extensions();
    let mut body = json!({});

    if let Some(key) = extensions.get::<IdentityKey>() {
        body["key"] = json!(key.to_string());
        body["namespace"] = json!(key.namespace());
    }

    // The field is left out entirely when no bearer credential was sent.
    match extensions.get::<RequestUser>() {
        Some(RequestUser::Authenticated(user)) => body["user"] = json!(user),
        Some(RequestUser::Rejected) => body["user"] = Value::Null,
        None => {}
    }

    Json(body)
}

async fn list_limits(State(registry): State<Arc<LimiterRegistry>>) -> Json<Value> {
    let limiters: Vec<Value> = registry
        .limiters()
        .map(|limiter| {
            let keys: BTreeMap<String, u64> = limiter
                .snapshot()
                .into_iter()
                .map(|(key, count)| (key.to_string(), count))
                .collect();
            json!({
                "name": limiter.name(),
                "window_ms": limiter.options().window_ms,
                "max": limiter.options().max,
                "keys": keys,
            })
        })
        .collect();

    Json(json!({ "limiters": limiters }))
}

async fn reset_limit(
    State(registry): State<Arc<LimiterRegistry>>,
    Path(key): Path<String>,
) -> Response {
    let key: IdentityKey = match key.parse() {
        Ok(key) => key,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    match registry.reset(&key).await {
        Ok(()) => {
            info!(key = %key, "Rate limit reset by admin");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Rate limit reset failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
