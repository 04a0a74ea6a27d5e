//! Throttle key construction.

/// Namespace used for the per-actor tier limits.
pub const TIER_NAMESPACE: &str = "rl";

/// A key that uniquely identifies one rate-limited dimension.
///
/// The key is composed of an operation namespace, the actor identifier and
/// an optional resource scope, joined with `:`. The window bucket is added
/// by the engine when it talks to the store.
///
/// Segments are not escaped, so the string form is only unique while the
/// actor holds no `:` in a namespace that is also used with a scope: actor
/// `42:a` and actor `42` scoped to `a` share a counter. IPv6 actors are safe
/// under the tier namespace, which is never scoped. Namespaces that take
/// scopes should be keyed by application ids, not addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    /// Operation namespace, e.g. `addr:create`
    pub namespace: String,
    /// Actor the limit applies to
    pub actor: String,
    /// Optional sub-resource, e.g. a conversation id
    pub scope: Option<String>,
}

impl ThrottleKey {
    /// Create a key for an actor within a namespace.
    pub fn new(namespace: &str, actor: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            actor: actor.to_string(),
            scope: None,
        }
    }

    /// Narrow the key to a sub-resource so it gets its own counter.
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    /// Convert the key to its string form.
    pub fn to_string_key(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{}:{}:{}", self.namespace, self.actor, scope),
            None => format!("{}:{}", self.namespace, self.actor),
        }
    }
}

impl std::fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Key under which the counter for `key` in `bucket` lives in the store.
pub fn store_key(key: &str, bucket: u64) -> String {
    format!("th:{}:{}", key, bucket)
}
