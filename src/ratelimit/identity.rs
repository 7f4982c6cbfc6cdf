//! Identity key generation and handling.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A key that uniquely identifies a requester bucket.
///
/// The rendered form is `<namespace>:<value>`, or the bare `anonymous`
/// sentinel when nothing identified the requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// An authenticated user id
    User(String),
    /// A session id taken from the session cookie
    Session(String),
    /// A client address, either forwarded or the socket peer
    Ip(String),
    /// Shared bucket for requests carrying no identity signal
    Anonymous,
}

impl IdentityKey {
    /// The namespace tag of this key.
    pub fn namespace(&self) -> &'static str {
        match self {
            IdentityKey::User(_) => "user",
            IdentityKey::Session(_) => "session",
            IdentityKey::Ip(_) => "ip",
            IdentityKey::Anonymous => "anonymous",
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, IdentityKey::Anonymous)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::User(id) => write!(f, "user:{}", id),
            IdentityKey::Session(sid) => write!(f, "session:{}", sid),
            IdentityKey::Ip(addr) => write!(f, "ip:{}", addr),
            IdentityKey::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// Error returned when a rendered key cannot be parsed back.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid identity key: {0:?}")]
pub struct ParseIdentityKeyError(String);

impl FromStr for IdentityKey {
    type Err = ParseIdentityKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "anonymous" {
            return Ok(IdentityKey::Anonymous);
        }

        // Split on the first separator only; IPv6 values contain ':' themselves.
        let (tag, value) = s
            .split_once(':')
            .ok_or_else(|| ParseIdentityKeyError(s.to_string()))?;
        if value.is_empty() {
            return Err(ParseIdentityKeyError(s.to_string()));
        }

        match tag {
            "user" => Ok(IdentityKey::User(value.to_string())),
            "session" => Ok(IdentityKey::Session(value.to_string())),
            "ip" => Ok(IdentityKey::Ip(value.to_string())),
            _ => Err(ParseIdentityKeyError(s.to_string())),
        }
    }
}

/// The identity signals available on a single request.
///
/// Built by the HTTP layer from request extensions, cookies and the
/// connection; kept free of any framework types so key derivation stays a
/// pure function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Id of the authenticated user, if the bearer token verified
    pub user_id: Option<String>,
    /// Session id
    pub session_id: Option<String>,
    /// Client address as resolved through trusted proxies
    pub ip: Option<String>,
    /// Address of the socket peer
    pub remote_addr: Option<String>,
}

impl RequestIdentity {
    /// Derive the bucket key. The first present signal wins, in the order
    /// user, session, ip, remote address.
    pub fn key(&self) -> IdentityKey {
        if let Some(id) = present(&self.user_id) {
            return IdentityKey::User(id.to_string());
        }
        if let Some(sid) = present(&self.session_id) {
            return IdentityKey::Session(sid.to_string());
        }
        if let Some(ip) = present(&self.ip).or_else(|| present(&self.remote_addr)) {
            return IdentityKey::Ip(ip.to_string());
        }
        IdentityKey::Anonymous
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(
        user_id: Option<&str>,
        session_id: Option<&str>,
        ip: Option<&str>,
        remote_addr: Option<&str>,
    ) -> RequestIdentity {
        RequestIdentity {
            user_id: user_id.map(String::from),
            session_id: session_id.map(String::from),
            ip: ip.map(String::from),
            remote_addr: remote_addr.map(String::from),
        }
    }

    #[test]
    fn test_user_id_wins_over_everything() {
        let all = identity(Some("u1"), Some("s1"), Some("1.2.3.4"), Some("5.6.7.8"));
        assert_eq!(all.key().to_string(), "user:u1");

        let only_user = identity(Some("u1"), None, None, None);
        assert_eq!(only_user.key().to_string(), "user:u1");
    }

    #[test]
    fn test_session_before_ip() {
        let id = identity(None, Some("abc"), Some("1.2.3.4"), None);
        assert_eq!(id.key(), IdentityKey::Session("abc".to_string()));
    }

    #[test]
    fn test_ip_without_user_or_session() {
        let id = identity(None, None, Some("1.2.3.4"), Some("9.9.9.9"));
        assert_eq!(id.key().to_string(), "ip:1.2.3.4");
    }

    #[test]
    fn test_remote_address_fallback() {
        let id = identity(None, None, None, Some("10.0.0.7"));
        assert_eq!(id.key().to_string(), "ip:10.0.0.7");
    }

    #[test]
    fn test_nothing_present_is_anonymous() {
        let id = RequestIdentity::default();
        assert_eq!(id.key(), IdentityKey::Anonymous);
        assert_eq!(id.key().to_string(), "anonymous");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let id = identity(Some(""), Some(""), None, Some("10.0.0.7"));
        assert_eq!(id.key().to_string(), "ip:10.0.0.7");
    }

    #[test]
    fn test_parse_rendered_keys() {
        for rendered in ["user:42", "session:xyz", "ip:::1", "ip:1.2.3.4", "anonymous"] {
            let key: IdentityKey = rendered.parse().unwrap();
            assert_eq!(key.to_string(), rendered);
        }
        assert_eq!(
            "ip:::1".parse::<IdentityKey>().unwrap(),
            IdentityKey::Ip("::1".to_string())
        );
    }

    #[test]
    fn test_parse_invalid_keys() {
        assert!("bogus".parse::<IdentityKey>().is_err());
        assert!("device:1".parse::<IdentityKey>().is_err());
        assert!("user:".parse::<IdentityKey>().is_err());
    }

    #[test]
    fn test_namespace() {
        assert_eq!(IdentityKey::User("a".into()).namespace(), "user");
        assert_eq!(IdentityKey::Anonymous.namespace(), "anonymous");
        assert!(IdentityKey::Anonymous.is_anonymous());
    }
}
