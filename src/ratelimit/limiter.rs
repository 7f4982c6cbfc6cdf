//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace, warn};

use super::backend::WindowBackend;
use super::identity::IdentityKey;
use super::store::{Sweeper, WindowStore};
use crate::error::{Result, StoreError, UserLimitError};

/// Default window length: 15 minutes.
pub const DEFAULT_WINDOW_MS: u64 = 15 * 60 * 1000;
/// Default number of requests allowed per window.
pub const DEFAULT_MAX: u64 = 100;

/// What to do with a request when the window store fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request uncounted
    #[default]
    Open,
    /// Reject the request as unavailable
    Closed,
}

/// Options for a single limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Window length in milliseconds
    #[serde(default = "default_window_ms", alias = "windowMs")]
    pub window_ms: u64,

    /// Requests allowed per window and identity
    #[serde(default = "default_max")]
    pub max: u64,

    /// Response body sent on rejection; a generated JSON body when unset
    #[serde(default)]
    pub message: Option<serde_json::Value>,

    /// Whether requests with no identity signal share the anonymous bucket.
    /// When disabled they are rejected instead.
    #[serde(default = "default_fallback_to_anonymous")]
    pub fallback_to_anonymous: bool,

    /// Behaviour when the store reports an error
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Sweep interval in milliseconds, defaults to the window length
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,

    /// Upper bound on tracked identities
    #[serde(default)]
    pub max_tracked_keys: Option<usize>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max: default_max(),
            message: None,
            fallback_to_anonymous: default_fallback_to_anonymous(),
            failure_mode: FailureMode::default(),
            sweep_interval_ms: None,
            max_tracked_keys: None,
        }
    }
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_max() -> u64 {
    DEFAULT_MAX
}

fn default_fallback_to_anonymous() -> bool {
    true
}

impl RateLimitOptions {
    /// Get the window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Get the sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.window_ms))
    }

    /// The rejection body: the configured message, or one describing the limit.
    pub fn message_body(&self) -> serde_json::Value {
        match &self.message {
            Some(message) => message.clone(),
            None => json!({
                "error": "Too many requests",
                "message": format!(
                    "Rate limit of {} requests per {} seconds exceeded, please try again later.",
                    self.max,
                    self.window().as_secs()
                ),
                "limit": self.max,
                "window_ms": self.window_ms,
            }),
        }
    }

    /// Reject zero-length windows and zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(UserLimitError::Config("window_ms must be positive".to_string()));
        }
        if self.max == 0 {
            return Err(UserLimitError::Config("max must be positive".to_string()));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(UserLimitError::Config(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Within the limit
    Allow { count: u64, limit: u64 },
    /// Over the limit
    Deny { count: u64, limit: u64 },
    /// No identity signal and the anonymous fallback is disabled
    Unidentified,
    /// Store failed, admitted uncounted (fail open)
    Degraded,
    /// Store failed, rejected (fail closed)
    Unavailable,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. } | Decision::Degraded)
    }

    /// Requests left in the window after this one, when counted.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            Decision::Allow { count, limit } | Decision::Deny { count, limit } => {
                Some(limit.saturating_sub(*count))
            }
            _ => None,
        }
    }
}

/// A window store plus the policy applied to its counts.
///
/// This struct is thread-safe and can be shared across request handlers
/// behind an `Arc`.
pub struct RateLimiter {
    /// Name used in logs and diagnostics
    name: String,
    /// Window, limit and response options
    options: RateLimitOptions,
    /// Rejection body, resolved once
    message: serde_json::Value,
    /// The counting store
    backend: Arc<dyn WindowBackend>,
    /// Periodic sweep of the owned store, if any
    sweeper: Option<Sweeper>,
}

impl RateLimiter {
    /// Create a limiter with its own in-memory store and sweep task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, options: RateLimitOptions) -> Result<Self> {
        options.validate()?;

        let mut store = WindowStore::new(options.window());
        if let Some(max_keys) = options.max_tracked_keys {
            store = store.with_max_keys(max_keys);
        }
        let store = Arc::new(store);
        let sweeper = store.spawn_sweeper(options.sweep_interval());

        let mut limiter = Self::with_backend(name, options, store)?;
        limiter.sweeper = Some(sweeper);
        Ok(limiter)
    }

    /// Create a limiter over an existing backend. No sweep task is started.
    pub fn with_backend(
        name: impl Into<String>,
        options: RateLimitOptions,
        backend: Arc<dyn WindowBackend>,
    ) -> Result<Self> {
        options.validate()?;
        let name = name.into();
        let message = options.message_body();

        debug!(
            limiter = %name,
            window_ms = options.window_ms,
            max = options.max,
            "Creating rate limiter"
        );

        Ok(Self {
            name,
            options,
            message,
            backend,
            sweeper: None,
        })
    }

    /// Count a request for `key` and decide whether it may proceed.
    pub async fn check(&self, key: &IdentityKey) -> Decision {
        if key.is_anonymous() && !self.options.fallback_to_anonymous {
            debug!(limiter = %self.name, "Rejecting unidentified request");
            return Decision::Unidentified;
        }

        let limit = self.options.max;
        match self.backend.increment(key).await {
            Ok(count) if count <= limit => {
                trace!(limiter = %self.name, key = %key, count = count, limit = limit, "Request allowed");
                Decision::Allow { count, limit }
            }
            Ok(count) => {
                debug!(
                    limiter = %self.name,
                    key = %key,
                    count = count,
                    limit = limit,
                    "Rate limit exceeded"
                );
                Decision::Deny { count, limit }
            }
            Err(e) => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    failure_mode = ?self.options.failure_mode,
                    "Window store failed"
                );
                match self.options.failure_mode {
                    FailureMode::Open => Decision::Degraded,
                    FailureMode::Closed => Decision::Unavailable,
                }
            }
        }
    }

    /// Forget all requests recorded for `key`.
    pub async fn reset(&self, key: &IdentityKey) -> std::result::Result<(), StoreError> {
        self.backend.reset(key).await
    }

    /// Live counts per key.
    pub fn snapshot(&self) -> Vec<(IdentityKey, u64)> {
        self.backend.snapshot()
    }

    /// Stop the sweep task, if this limiter owns one.
    pub fn close(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.close();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    /// Get the body sent with rejections.
    pub fn message(&self) -> &serde_json::Value {
        &self.message
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}
