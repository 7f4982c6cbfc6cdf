//! Reading identity signals off an HTTP request.

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{header::COOKIE, HeaderMap, Request},
};
use serde::{Deserialize, Serialize};

use super::auth::RequestUser;
use crate::ratelimit::RequestIdentity;

/// How identity signals are read from requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Name of the session cookie
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that sets these headers.
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            session_cookie: default_session_cookie(),
            trust_proxy: false,
        }
    }
}

fn default_session_cookie() -> String {
    "sid".to_string()
}

/// Collect the identity signals of a request.
pub fn request_identity<B>(request: &Request<B>, settings: &IdentitySettings) -> RequestIdentity {
    let extensions = request.extensions();
    let headers = request.headers();

    RequestIdentity {
        user_id: extensions
            .get::<RequestUser>()
            .and_then(RequestUser::user_id)
            .map(str::to_string),
        session_id: cookie_value(headers, &settings.session_cookie),
        ip: if settings.trust_proxy {
            forwarded_ip(headers)
        } else {
            None
        },
        remote_addr: extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string()),
    }
}

/// Value of the named cookie, across all `Cookie` headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Client address reported by a proxy.
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    // The first hop in X-Forwarded-For is the original client.
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::auth::AuthUser;
    use axum::body::Body;

    fn request() -> axum::http::request::Builder {
        Request::builder().uri("/whoami")
    }

    fn with_peer(mut request: Request<Body>, addr: &str) -> Request<Body> {
        let addr: SocketAddr = addr.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[test]
    fn test_authenticated_user() {
        let mut req = request()
            .header(COOKIE, "sid=abc")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(RequestUser::Authenticated(AuthUser { id: "u1".to_string() }));

        let identity = request_identity(&req, &IdentitySettings::default());
        assert_eq!(identity.user_id.as_deref(), Some("u1"));
        assert_eq!(identity.key().to_string(), "user:u1");
    }

    #[test]
    fn test_rejected_user_falls_through() {
        let mut req = with_peer(request().body(Body::empty()).unwrap(), "10.1.2.3:5555");
        req.extensions_mut().insert(RequestUser::Rejected);

        let identity = request_identity(&req, &IdentitySettings::default());
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.key().to_string(), "ip:10.1.2.3");
    }

    #[test]
    fn test_session_cookie() {
        let req = request()
            .header(COOKIE, "theme=dark; sid=s%3Aabc.sig ; other=1")
            .body(Body::empty())
            .unwrap();

        let identity = request_identity(&req, &IdentitySettings::default());
        assert_eq!(identity.session_id.as_deref(), Some("s%3Aabc.sig"));
        assert_eq!(identity.key().to_string(), "session:s%3Aabc.sig");
    }

    #[test]
    fn test_custom_cookie_name() {
        let settings = IdentitySettings {
            session_cookie: "connect.sid".to_string(),
            trust_proxy: false,
        };
        let req = request()
            .header(COOKIE, "sid=ignored; connect.sid=real")
            .body(Body::empty())
            .unwrap();

        assert_eq!(
            request_identity(&req, &settings).session_id.as_deref(),
            Some("real")
        );
    }

    #[test]
    fn test_forwarded_headers_ignored_without_trust() {
        let req = with_peer(
            request()
                .header("x-forwarded-for", "203.0.113.9")
                .body(Body::empty())
                .unwrap(),
            "10.0.0.1:4000",
        );

        let identity = request_identity(&req, &IdentitySettings::default());
        assert_eq!(identity.ip, None);
        assert_eq!(identity.key().to_string(), "ip:10.0.0.1");
    }

    #[test]
    fn test_forwarded_headers_with_trust() {
        let settings = IdentitySettings {
            trust_proxy: true,
            ..IdentitySettings::default()
        };

        let req = with_peer(
            request()
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.2")
                .body(Body::empty())
                .unwrap(),
            "10.0.0.1:4000",
        );
        assert_eq!(request_identity(&req, &settings).key().to_string(), "ip:203.0.113.9");

        let req = request()
            .header("x-real-ip", "198.51.100.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_identity(&req, &settings).key().to_string(), "ip:198.51.100.4");
    }

    #[test]
    fn test_ipv6_peer() {
        let req = with_peer(request().body(Body::empty()).unwrap(), "[::1]:8080");
        assert_eq!(
            request_identity(&req, &IdentitySettings::default()).key().to_string(),
            "ip:::1"
        );
    }

    #[test]
    fn test_no_signals() {
        let req = request().body(Body::empty()).unwrap();
        assert!(request_identity(&req, &IdentitySettings::default())
            .key()
            .is_anonymous());
    }
}
