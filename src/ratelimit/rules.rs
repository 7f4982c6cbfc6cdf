//! Per-route rate limit rules and matching.
//!
//! Rules give individual routes their own window, limit and message. Any
//! setting a rule leaves out is inherited from the base limiter options.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::limiter::RateLimitOptions;
use crate::error::{Result, UserLimitError};

/// A complete rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRules {
    /// Rules in file order
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// A rate limit applied to every path under a prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Name used in logs and diagnostics
    pub name: String,
    /// Path prefix, matched on segment boundaries
    pub path_prefix: String,
    /// HTTP methods this rule covers; empty means any method
    #[serde(default)]
    pub methods: Vec<String>,
    /// Window override in milliseconds
    #[serde(default, alias = "windowMs")]
    pub window_ms: Option<u64>,
    /// Limit override
    #[serde(default)]
    pub max: Option<u64>,
    /// Rejection body override
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

impl RouteRule {
    /// Whether this rule covers a request.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }

        let prefix = self.path_prefix.as_str();
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }

    /// The base options with this rule's overrides applied.
    pub fn options(&self, base: &RateLimitOptions) -> RateLimitOptions {
        let mut options = base.clone();
        if let Some(window_ms) = self.window_ms {
            options.window_ms = window_ms;
            // A sweep interval tied to the base window would be wrong here.
            options.sweep_interval_ms = None;
        }
        if let Some(max) = self.max {
            options.max = max;
        }
        if self.message.is_some() {
            options.message = self.message.clone();
        }
        options
    }
}

impl RouteRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // A bare list of rules is accepted as well as a `routes:` mapping.
        let rules = match serde_yaml::from_str::<Vec<RouteRule>>(yaml) {
            Ok(routes) => RouteRules { routes },
            Err(_) => serde_yaml::from_str(yaml)
                .map_err(|e| UserLimitError::Rules(format!("Failed to parse route rules: {}", e)))?,
        };

        rules.validate()?;
        Ok(rules)
    }

    /// Check names are unique and prefixes are absolute paths.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for rule in &self.routes {
            if rule.name.is_empty() {
                return Err(UserLimitError::Rules("rule name must not be empty".to_string()));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(UserLimitError::Rules(format!("duplicate rule name: {}", rule.name)));
            }
            if !rule.path_prefix.starts_with('/') {
                return Err(UserLimitError::Rules(format!(
                    "rule {}: path_prefix must start with '/'",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    /// Find the rule covering a request. The longest matching prefix wins;
    /// ties go to the rule listed first.
    pub fn find_rule(&self, path: &str, method: &str) -> Option<&RouteRule> {
        self.find_index(path, method).map(|i| &self.routes[i])
    }

    /// Position of the rule covering a request.
    pub fn find_index(&self, path: &str, method: &str) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, rule) in self.routes.iter().enumerate() {
            if !rule.matches(path, method) {
                continue;
            }
            let len = rule.path_prefix.len();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((index, len));
            }
        }
        best.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
routes:
  - name: bookmarks
    path_prefix: /api/bookmarks
    max: 50
  - name: bookmark-writes
    path_prefix: /api/bookmarks
    methods: [POST, PUT, DELETE]
    max: 10
    windowMs: 60000
  - name: clicks
    path_prefix: /api/bookmarks/click
    max: 500
    message:
      error: too many clicks
"#;

    #[test]
    fn test_parse_rules() {
        let rules = RouteRules::from_yaml(RULES).unwrap();
        assert_eq!(rules.routes.len(), 3);
        assert_eq!(rules.routes[1].methods, vec!["POST", "PUT", "DELETE"]);
        assert_eq!(rules.routes[1].window_ms, Some(60_000));
    }

    #[test]
    fn test_parse_bare_list() {
        let yaml = r#"
- name: login
  path_prefix: /auth/login
  max: 5
"#;
        let rules = RouteRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.routes.len(), 1);
        assert_eq!(rules.routes[0].name, "login");
    }

    #[test]
    fn test_prefix_matches_on_segment_boundary() {
        let rule = RouteRule {
            name: "groups".to_string(),
            path_prefix: "/api/groups".to_string(),
            methods: Vec::new(),
            window_ms: None,
            max: None,
            message: None,
        };

        assert!(rule.matches("/api/groups", "GET"));
        assert!(rule.matches("/api/groups/7", "DELETE"));
        assert!(!rule.matches("/api/groupsettings", "GET"));
        assert!(!rule.matches("/api", "GET"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rules = RouteRules::from_yaml(RULES).unwrap();

        let rule = rules.find_rule("/api/bookmarks/click/12", "POST").unwrap();
        assert_eq!(rule.name, "clicks");

        let rule = rules.find_rule("/api/bookmarks/12", "GET").unwrap();
        assert_eq!(rule.name, "bookmarks");
    }

    #[test]
    fn test_first_listed_wins_ties() {
        let rules = RouteRules::from_yaml(RULES).unwrap();

        // Both bookmark rules cover POST with the same prefix.
        let rule = rules.find_rule("/api/bookmarks", "post").unwrap();
        assert_eq!(rule.name, "bookmarks");
    }

    #[test]
    fn test_method_filter() {
        let yaml = r#"
routes:
  - name: writes
    path_prefix: /api
    methods: [POST]
    max: 1
"#;
        let rules = RouteRules::from_yaml(yaml).unwrap();
        assert!(rules.find_rule("/api/groups", "POST").is_some());
        assert!(rules.find_rule("/api/groups", "GET").is_none());
    }

    #[test]
    fn test_no_match() {
        let rules = RouteRules::from_yaml(RULES).unwrap();
        assert!(rules.find_rule("/health", "GET").is_none());
        assert!(RouteRules::new().find_rule("/api/bookmarks", "GET").is_none());
    }

    #[test]
    fn test_sample_rules_cover_served_route() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/rules.yaml");
        let rules = RouteRules::from_file(path).unwrap();

        assert_eq!(rules.find_rule("/whoami", "GET").unwrap().name, "whoami");
        assert_eq!(rules.find_rule("/api/bookmarks/click/1", "GET").unwrap().name, "clicks");
        assert!(rules.find_rule("/health", "GET").is_none());
    }

    #[test]
    fn test_rule_overrides_base_options() {
        let rules = RouteRules::from_yaml(RULES).unwrap();
        let base = RateLimitOptions {
            sweep_interval_ms: Some(5_000),
            ..RateLimitOptions::default()
        };

        let writes = rules.routes[1].options(&base);
        assert_eq!(writes.max, 10);
        assert_eq!(writes.window_ms, 60_000);
        assert_eq!(writes.sweep_interval_ms, None);
        assert_eq!(writes.message, None);

        let clicks = rules.routes[2].options(&base);
        assert_eq!(clicks.max, 500);
        assert_eq!(clicks.window_ms, base.window_ms);
        assert_eq!(clicks.sweep_interval_ms, Some(5_000));
        assert_eq!(clicks.message.unwrap()["error"], "too many clicks");
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let duplicate = r#"
routes:
  - name: a
    path_prefix: /x
  - name: a
    path_prefix: /y
"#;
        assert!(RouteRules::from_yaml(duplicate).is_err());

        let relative = r#"
routes:
  - name: a
    path_prefix: api
"#;
        assert!(RouteRules::from_yaml(relative).is_err());

        assert!(RouteRules::from_yaml("routes: 12").is_err());
    }
}
