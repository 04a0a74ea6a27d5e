//! Limit policy: per-tier ceilings and named operation limits.
//!
//! Operations are addressed by name (for example `addr:create`) and the name
//! doubles as the key namespace for their counters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::window::FixedWindow;
use crate::error::{Result, TurnstileError};

/// A `(limit, window)` pair.
///
/// A non-positive `limit` or `window_seconds` disables throttling for the
/// call site using this rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Calls allowed per window
    pub limit: i64,
    /// Window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
}

fn default_window_seconds() -> i64 {
    60
}

impl LimitRule {
    /// Create a rule.
    pub const fn new(limit: i64, window_seconds: i64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }

    /// Whether this rule turns throttling off.
    pub fn is_disabled(&self) -> bool {
        self.limit <= 0 || FixedWindow::new(self.window_seconds).is_none()
    }
}

/// Who is making the call, as far as limit selection is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// No authenticated session
    Anonymous,
    /// An authenticated user with the given application id
    Authenticated(String),
}

impl Principal {
    /// Whether the principal is authenticated.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Principal::Authenticated(_))
    }
}

/// A call-site limit: a key namespace with its own rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Namespace prefixed to every key of this operation
    pub namespace: String,
    /// Limit for the operation
    pub rule: LimitRule,
}

impl Operation {
    /// Create an operation limit.
    pub fn new(namespace: &str, limit: i64, window_seconds: i64) -> Self {
        Self {
            namespace: namespace.to_string(),
            rule: LimitRule::new(limit, window_seconds),
        }
    }
}

/// The complete limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Ceiling for anonymous actors
    #[serde(default = "default_anonymous")]
    pub anonymous: LimitRule,
    /// Ceiling for authenticated actors
    #[serde(default = "default_authenticated")]
    pub authenticated: LimitRule,
    /// Named call-site limits
    #[serde(default)]
    pub operations: HashMap<String, LimitRule>,
}

fn default_anonymous() -> LimitRule {
    LimitRule::new(60, 60)
}

fn default_authenticated() -> LimitRule {
    LimitRule::new(240, 60)
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            anonymous: default_anonymous(),
            authenticated: default_authenticated(),
            operations: HashMap::new(),
        }
    }
}

impl RateLimitPolicy {
    /// Load a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rate limit policy: {}", e)))
    }

    /// The ceiling that applies to `principal`.
    pub fn tier(&self, principal: &Principal) -> LimitRule {
        if principal.is_authenticated() {
            self.authenticated
        } else {
            self.anonymous
        }
    }

    /// Look up a named operation.
    pub fn operation(&self, name: &str) -> Option<Operation> {
        self.operations.get(name).map(|rule| Operation {
            namespace: name.to_string(),
            rule: *rule,
        })
    }

    /// Register or replace a named operation.
    pub fn insert_operation(&mut self, name: &str, rule: LimitRule) {
        self.operations.insert(name.to_string(), rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers() {
        let policy = RateLimitPolicy::default();

        assert_eq!(policy.tier(&Principal::Anonymous), LimitRule::new(60, 60));
        assert_eq!(
            policy.tier(&Principal::Authenticated("42".to_string())),
            LimitRule::new(240, 60)
        );
    }

    #[test]
    fn test_parse_policy() {
        let yaml = r#"
anonymous:
  limit: 30
  window_seconds: 60
authenticated:
  limit: 120
operations:
  "addr:create":
    limit: 20
    window_seconds: 60
  "delivery:create":
    limit: 10
"#;
        let policy = RateLimitPolicy::from_yaml(yaml).unwrap();

        assert_eq!(policy.anonymous, LimitRule::new(30, 60));
        assert_eq!(policy.authenticated, LimitRule::new(120, 60));
        assert_eq!(
            policy.operation("addr:create"),
            Some(Operation::new("addr:create", 20, 60))
        );
        assert_eq!(
            policy.operation("delivery:create").unwrap().rule,
            LimitRule::new(10, 60)
        );
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let policy = RateLimitPolicy::from_yaml("operations: {}").unwrap();
        assert_eq!(policy, RateLimitPolicy::default());
    }

    #[test]
    fn test_unknown_operation() {
        let policy = RateLimitPolicy::default();
        assert!(policy.operation("nope").is_none());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = RateLimitPolicy::from_yaml("anonymous: [1, 2").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_disabled_rules() {
        assert!(LimitRule::new(0, 60).is_disabled());
        assert!(LimitRule::new(-1, 60).is_disabled());
        assert!(LimitRule::new(10, 0).is_disabled());
        assert!(!LimitRule::new(10, 60).is_disabled());
    }

    #[test]
    fn test_insert_operation() {
        let mut policy = RateLimitPolicy::default();
        policy.insert_operation("chat:start", LimitRule::new(20, 60));
        assert_eq!(policy.operation("chat:start").unwrap().namespace, "chat:start");
    }
}
