//! Configuration management for userlimit.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables prefixed `USERLIMIT__` with `__` between nested keys, e.g.
//! `USERLIMIT__AUTH__JWT_SECRET` or `USERLIMIT__RATE_LIMITING__LIMITS__MAX`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Result, UserLimitError};
use crate::http::IdentitySettings;
use crate::ratelimit::RateLimitOptions;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "USERLIMIT";

/// Shortest accepted signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Environment variable replacing the rejection message.
const MESSAGE_ENV: &str = "USERLIMIT__RATE_LIMITING__LIMITS__MESSAGE";

/// Main configuration for the userlimit service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserLimitConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Bearer credential configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Serve the `/admin` endpoints
    #[serde(default)]
    pub admin_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_enabled: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Bearer credential configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens. Bearer decoding is off when unset.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Options of the default limiter, inherited by route rules
    #[serde(default)]
    pub limits: RateLimitOptions,

    /// Path to a YAML file of per-route rules
    #[serde(default)]
    pub rules_path: Option<String>,

    /// How requesters are identified
    #[serde(default)]
    pub identity: IdentitySettings,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl UserLimitConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// The file is parsed as YAML first, so option aliases such as
    /// `windowMs` and the case of keys inside `message` survive. Environment
    /// values are layered on top and converted to the type of their field;
    /// they are never parsed speculatively, so a numeric secret stays a string.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => Self::parse_file(path)?,
            None => Self::default(),
        };
        let message = file.rate_limiting.limits.message.clone();

        let mut config: UserLimitConfig = config::Config::builder()
            .add_source(config::Config::try_from(&file)?)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        // Layered keys come back lowercased; the body is sent verbatim.
        if std::env::var_os(MESSAGE_ENV).is_none() {
            config.rate_limiting.limits.message = message;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Self::parse_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_yaml(&contents)
    }

    fn parse_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| UserLimitError::Config(e.to_string()))
    }

    /// Check limiter options and the signing secret.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.limits.validate()?;

        if let Some(secret) = &self.auth.jwt_secret {
            if secret.len() < MIN_SECRET_LEN {
                return Err(UserLimitError::Config(format!(
                    "auth.jwt_secret must be at least {} bytes",
                    MIN_SECRET_LEN
                )));
            }
        }

        if self.rate_limiting.identity.session_cookie.is_empty() {
            return Err(UserLimitError::Config(
                "rate_limiting.identity.session_cookie must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
