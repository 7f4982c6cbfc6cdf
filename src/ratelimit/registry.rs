//! The set of limiters a server runs: one default plus one per route rule.

use std::sync::Arc;

use tracing::info;

use super::identity::IdentityKey;
use super::limiter::{RateLimitOptions, RateLimiter};
use super::rules::RouteRules;
use crate::error::{Result, StoreError};

/// Name of the limiter applied when no route rule matches.
pub const DEFAULT_LIMITER: &str = "default";

/// Limiters selected by request path and method.
///
/// Every limiter owns its own store, so a route rule never shares counts
/// with the default limiter or with another rule.
pub struct LimiterRegistry {
    rules: RouteRules,
    default: Arc<RateLimiter>,
    /// One limiter per rule, same order as `rules.routes`
    routes: Vec<Arc<RateLimiter>>,
}

impl LimiterRegistry {
    /// Build the default limiter and one limiter per rule.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(base: RateLimitOptions, rules: RouteRules) -> Result<Self> {
        rules.validate()?;

        let default = Arc::new(RateLimiter::new(DEFAULT_LIMITER, base.clone())?);
        let mut routes = Vec::with_capacity(rules.routes.len());
        for rule in &rules.routes {
            let limiter = RateLimiter::new(rule.name.clone(), rule.options(&base))?;
            routes.push(Arc::new(limiter));
        }

        info!(
            route_rules = routes.len(),
            window_ms = base.window_ms,
            max = base.max,
            "Rate limiters initialized"
        );

        Ok(Self {
            rules,
            default,
            routes,
        })
    }

    /// A registry holding only the given limiter.
    pub fn single(limiter: Arc<RateLimiter>) -> Self {
        Self {
            rules: RouteRules::new(),
            default: limiter,
            routes: Vec::new(),
        }
    }

    /// The limiter for a request.
    pub fn select(&self, path: &str, method: &str) -> &Arc<RateLimiter> {
        self.rules
            .find_index(path, method)
            .map(|index| &self.routes[index])
            .unwrap_or(&self.default)
    }

    pub fn default_limiter(&self) -> &Arc<RateLimiter> {
        &self.default
    }

    /// Every limiter, default first.
    pub fn limiters(&self) -> impl Iterator<Item = &Arc<RateLimiter>> {
        std::iter::once(&self.default).chain(self.routes.iter())
    }

    /// Reset `key` in every limiter.
    pub async fn reset(&self, key: &IdentityKey) -> std::result::Result<(), StoreError> {
        for limiter in self.limiters() {
            limiter.reset(key).await?;
        }
        Ok(())
    }

    /// Stop every sweep task.
    pub fn close(&self) {
        for limiter in self.limiters() {
            limiter.close();
        }
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("default", &self.default)
            .field("routes", &self.routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Decision;

    fn rules() -> RouteRules {
        RouteRules::from_yaml(
            r#"
routes:
  - name: writes
    path_prefix: /api/bookmarks
    methods: [POST]
    max: 1
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_select_by_route() {
        let registry = LimiterRegistry::new(RateLimitOptions::default(), rules()).unwrap();

        assert_eq!(registry.select("/api/bookmarks", "POST").name(), "writes");
        assert_eq!(registry.select("/api/bookmarks", "GET").name(), DEFAULT_LIMITER);
        assert_eq!(registry.select("/whoami", "GET").name(), DEFAULT_LIMITER);
        assert_eq!(registry.limiters().count(), 2);

        registry.close();
    }

    #[tokio::test]
    async fn test_route_limiters_count_separately() {
        let registry = LimiterRegistry::new(RateLimitOptions::default(), rules()).unwrap();
        let key = IdentityKey::User("u1".to_string());

        let writes = registry.select("/api/bookmarks", "POST");
        assert!(writes.check(&key).await.is_allowed());
        assert_eq!(writes.check(&key).await, Decision::Deny { count: 2, limit: 1 });

        // The default limiter has not seen this user yet.
        let reads = registry.select("/api/bookmarks", "GET");
        assert_eq!(reads.check(&key).await, Decision::Allow { count: 1, limit: 100 });

        registry.reset(&key).await.unwrap();
        assert!(writes.check(&key).await.is_allowed());

        registry.close();
    }

    #[tokio::test]
    async fn test_single_registry() {
        let limiter = Arc::new(RateLimiter::new("only", RateLimitOptions::default()).unwrap());
        let registry = LimiterRegistry::single(limiter);

        assert_eq!(registry.select("/anything", "GET").name(), "only");
        registry.close();
    }
}
