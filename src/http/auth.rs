//! Bearer token identity bridge.
//!
//! Decodes `Authorization: Bearer <token>` on a best-effort basis so the
//! rate limiter can key on the user. It never rejects a request: a bad
//! token only means the request is counted by session or address instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::Result;

/// The authenticated user attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub id: String,
}

/// Outcome of bearer decoding, stored in the request extensions.
///
/// The extension is absent when the request carried no bearer credential at
/// all; `Rejected` marks a bearer credential that failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestUser {
    Authenticated(AuthUser),
    Rejected,
}

impl RequestUser {
    /// Id of the authenticated user, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            RequestUser::Authenticated(user) => Some(&user.id),
            RequestUser::Rejected => None,
        }
    }
}

/// The `userId` claim, issued as either a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserIdClaim {
    Text(String),
    Number(i64),
}

impl fmt::Display for UserIdClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserIdClaim::Text(id) => f.write_str(id),
            UserIdClaim::Number(id) => write!(f, "{}", id),
        }
    }
}

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The user the token was issued to
    #[serde(rename = "userId")]
    pub user_id: UserIdClaim,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Expiration (Unix timestamp); tokens without one never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// HMAC-SHA256 token signing and verification with a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present but tokens are not required to carry it.
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a token's signature and expiry and return its claims.
    pub fn verify(&self, token: &str) -> std::result::Result<TokenClaims, jsonwebtoken::errors::Error> {
        jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
    }

    /// Sign a token for `user_id`, expiring after `ttl` when given.
    pub fn issue(&self, user_id: &str, ttl: Option<Duration>) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            user_id: UserIdClaim::Text(user_id.to_string()),
            iat: Some(now),
            exp: ttl.map(|ttl| now + ttl.as_secs() as i64),
            jti: Some(uuid::Uuid::new_v4().to_string()),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Decode a bearer credential into the request user.
    pub fn resolve(&self, token: &str) -> RequestUser {
        match self.verify(token) {
            Ok(claims) => {
                let id = claims.user_id.to_string();
                trace!(user_id = %id, "Bearer token verified");
                RequestUser::Authenticated(AuthUser { id })
            }
            Err(e) => {
                debug!(error = %e, "Invalid bearer token");
                RequestUser::Rejected
            }
        }
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &Algorithm::HS256)
            .finish_non_exhaustive()
    }
}

/// The token of a bearer `Authorization` header.
///
/// `None` when the header is missing, unreadable or uses another scheme.
/// A bearer header with an empty token yields `Some("")`, which then fails
/// verification like any other bad token.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    Some(token.trim())
}

/// Middleware that attaches a [`RequestUser`] for bearer requests.
///
/// Without a verifier no token can be trusted, so every bearer request is
/// marked [`RequestUser::Rejected`]. Always runs the rest of the chain.
pub async fn resolve_bearer_user(
    State(verifier): State<Option<Arc<TokenVerifier>>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let user = bearer_token(request.headers()).map(|token| match &verifier {
        Some(verifier) => verifier.resolve(token),
        None => {
            debug!("Bearer token ignored, no signing secret configured");
            RequestUser::Rejected
        }
    });

    if let Some(user) = user {
        request.extensions_mut().insert(user);
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &[u8] = b"test-secret-that-is-long-enough!";

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    #[test]
    fn test_issue_and_verify() {
        let verifier = TokenVerifier::new(SECRET);
        let token = verifier.issue("user123", Some(Duration::from_secs(3600))).unwrap();

        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.user_id, UserIdClaim::Text("user123".to_string()));
        assert!(claims.exp.is_some());
        assert!(claims.jti.is_some());
    }

    #[test]
    fn test_token_without_expiry_is_accepted() {
        let verifier = TokenVerifier::new(SECRET);
        let token = verifier.issue("user123", None).unwrap();
        assert_eq!(
            verifier.resolve(&token),
            RequestUser::Authenticated(AuthUser {
                id: "user123".to_string()
            })
        );
    }

    #[test]
    fn test_numeric_user_id() {
        let claims = serde_json::json!({ "userId": 42 });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(verifier.resolve(&token).user_id(), Some("42"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = TokenVerifier::new(b"another-secret-entirely-here!!!!")
            .issue("user123", None)
            .unwrap();

        let verifier = TokenVerifier::new(SECRET);
        assert!(verifier.verify(&token).is_err());
        assert_eq!(verifier.resolve(&token), RequestUser::Rejected);
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            user_id: UserIdClaim::Text("user123".to_string()),
            iat: Some(now - 7200),
            exp: Some(now - 3600),
            jti: None,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert_eq!(TokenVerifier::new(SECRET).resolve(&token), RequestUser::Rejected);
    }

    #[test]
    fn test_token_missing_user_id_rejected() {
        let claims = serde_json::json!({ "sub": "user123" });
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert_eq!(TokenVerifier::new(SECRET).resolve(&token), RequestUser::Rejected);
    }

    #[test]
    fn test_garbage_token_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(verifier.resolve("invalid-token"), RequestUser::Rejected);
        assert_eq!(verifier.resolve(""), RequestUser::Rejected);
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&headers("Bearer abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(&headers("bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("Bearer")), Some(""));
        assert_eq!(bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_debug_hides_keys() {
        let rendered = format!("{:?}", TokenVerifier::new(SECRET));
        assert!(!rendered.contains("test-secret"));
    }
}
